//! JobTypeRegistry - ジョブ型タグの登録と解決
//!
//! ジョブ行には型タグ（文字列）だけを保存し、起動時に登録されたレジストリで
//! 型ごとの振る舞い（同時実行禁止・実行後のデータ保存）を解決します。
//!
//! # 学習ポイント
//! - Associated Constants にデフォルト値を持たせる
//! - Generic methods での登録と型安全性

use std::collections::HashMap;

use crate::domain::PersistenceError;

/// JobKind はジョブ型タグと型レベルのフラグを対応付ける
///
/// # 使用例
/// ```ignore
/// struct NightlyReport;
///
/// impl JobKind for NightlyReport {
///     const TYPE: &'static str = "reports.nightly.v1";
///     const DISALLOW_CONCURRENT_EXECUTION: bool = true;
/// }
/// ```
pub trait JobKind: Send + Sync + 'static {
    /// `{namespace}.{job}.v{major}` 形式を推奨
    const TYPE: &'static str;

    /// Only one execution of a job of this type may run at a time.
    const DISALLOW_CONCURRENT_EXECUTION: bool = false;

    /// Job data changed during execution is written back on completion.
    const PERSIST_JOB_DATA_AFTER_EXECUTION: bool = false;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTypeDescriptor {
    pub job_type: String,
    pub disallow_concurrent_execution: bool,
    pub persist_job_data_after_execution: bool,
}

impl JobTypeDescriptor {
    pub fn of<K: JobKind>() -> Self {
        Self {
            job_type: K::TYPE.to_string(),
            disallow_concurrent_execution: K::DISALLOW_CONCURRENT_EXECUTION,
            persist_job_data_after_execution: K::PERSIST_JOB_DATA_AFTER_EXECUTION,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job type '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Debug, Clone, Default)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobTypeDescriptor>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K: JobKind>(&mut self) -> Result<(), RegistryError> {
        self.register_descriptor(JobTypeDescriptor::of::<K>())
    }

    /// Registers a type known only at runtime (e.g. from configuration).
    pub fn register_descriptor(&mut self, descriptor: JobTypeDescriptor) -> Result<(), RegistryError> {
        if self.types.contains_key(&descriptor.job_type) {
            return Err(RegistryError::AlreadyRegistered(descriptor.job_type));
        }
        self.types.insert(descriptor.job_type.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, job_type: &str) -> Option<&JobTypeDescriptor> {
        self.types.get(job_type)
    }

    pub fn resolve(&self, job_type: &str) -> Result<&JobTypeDescriptor, PersistenceError> {
        self.get(job_type)
            .ok_or_else(|| PersistenceError::UnknownJobType(job_type.to_string()))
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }
}
