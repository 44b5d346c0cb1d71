//! Модуль для работы с субтитрами
//!
//! Разбор файлов реплик и подготовка их текста к синтезу.

pub mod normalizer;
pub mod parser;

pub use normalizer::normalize;
pub use parser::{detect_grammar, parse_cue_file, parse_cues, CueGrammar};
