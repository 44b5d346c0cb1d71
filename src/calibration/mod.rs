//! Модуль калибровки длительности
//!
//! Два уровня: калибратор сегмента подбирает масштаб для каждой реплики,
//! глобальный калибратор гоняет итерации по всему файлу и сохраняет
//! сошедшиеся параметры в кэш.

pub mod cache;
pub mod global;
pub mod segment;
pub mod state;

pub use cache::{pipeline_key, CalibrationCache};
pub use global::{GlobalCalibrator, RunOutcome};
pub use segment::{precision, SegmentCalibrator};
pub use state::{CalibrationState, IterationRecord};
