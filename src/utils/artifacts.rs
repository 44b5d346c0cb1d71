//! Модуль для работы с промежуточными файлами прогона
//!
//! Каждая попытка синтеза пишется в свой файл
//! `iter{n}/seg{index:04}_try{attempt}.wav` и не перезаписывается до конца
//! прогона, чтобы попытки можно было сравнить.

use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info, warn};
use tempfile::TempDir;
use uuid::Uuid;

use crate::error::Result;

/// Хранилище промежуточных файлов одного прогона
pub struct ArtifactStore {
    root: PathBuf,
    /// Держит временную директорию живой, если work_dir не задан
    temp_dir: Option<TempDir>,
    keep: bool,
    run_id: String,
}

impl ArtifactStore {
    /// Создать хранилище в `work_dir` или во временной директории
    pub fn new(work_dir: Option<&Path>, keep: bool) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let (root, temp_dir) = match work_dir {
            Some(dir) => {
                let root = dir.join(format!("dubsync_{}", run_id));
                fs::create_dir_all(&root)?;
                (root, None)
            }
            None => {
                let temp = tempfile::Builder::new().prefix("dubsync_").tempdir()?;
                if keep {
                    (temp.into_path(), None)
                } else {
                    (temp.path().to_path_buf(), Some(temp))
                }
            }
        };
        debug!("Artifacts for run {} in {}", run_id, root.display());

        Ok(Self { root, temp_dir, keep, run_id })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Директория итерации (создаётся при первом обращении)
    pub fn iteration_dir(&self, iteration: u32) -> Result<PathBuf> {
        let dir = self.root.join(format!("iter{}", iteration));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Файл попытки синтеза сегмента
    pub fn attempt_path(&self, iteration: u32, index: usize, attempt: u32) -> Result<PathBuf> {
        Ok(self
            .iteration_dir(iteration)?
            .join(format!("seg{:04}_try{}.wav", index, attempt)))
    }

    /// Файл фрагмента сборки (тишина, растянутый клип, итог)
    pub fn piece_path(&self, iteration: u32, name: &str) -> Result<PathBuf> {
        Ok(self.iteration_dir(iteration)?.join(name))
    }

    /// Удалить файлы итерации (отменённой или проигравшей)
    pub fn discard_iteration(&self, iteration: u32) {
        if self.keep {
            return;
        }
        let dir = self.root.join(format!("iter{}", iteration));
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

impl Drop for ArtifactStore {
    fn drop(&mut self) {
        if self.keep {
            info!("Keeping artifacts in {}", self.root.display());
            return;
        }
        // временную директорию удалит TempDir
        if self.temp_dir.is_none() && self.root.exists() {
            let _ = fs::remove_dir_all(&self.root);
        }
    }
}
