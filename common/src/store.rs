use log::{info, warn};
use thiserror::Error;

use crate::config::LoggerConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read config blob: {0}")]
    Read(String),
    #[error("failed to write config blob: {0}")]
    Write(String),
    #[error("failed to encode config: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait BlobStore {
    /// `Ok(None)` when nothing has been written yet.
    fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError>;

    fn write(&mut self, blob: &[u8]) -> Result<(), StoreError>;
}

pub fn load_config<S: BlobStore>(store: &mut S) -> (LoggerConfig, bool) {
    let blob = match store.read() {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            info!("no stored configuration; using defaults");
            return (LoggerConfig::default(), false);
        }
        Err(err) => {
            warn!("{err}; using defaults");
            return (LoggerConfig::default(), false);
        }
    };

    match LoggerConfig::decode(&blob) {
        Ok(config) => (config, true),
        Err(err) => {
            warn!("stored configuration is malformed ({err}); using defaults");
            (LoggerConfig::default(), false)
        }
    }
}

pub fn save_config<S: BlobStore>(store: &mut S, config: &LoggerConfig) -> Result<(), StoreError> {
    let blob = config.encode()?;
    store.write(&blob)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub blob: Option<Vec<u8>>,
        pub fail_reads: bool,
        pub fail_writes: bool,
        pub writes: usize,
    }

    impl BlobStore for MemoryStore {
        fn read(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Read("flash unavailable".to_string()));
            }
            Ok(self.blob.clone())
        }

        fn write(&mut self, blob: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes {
                return Err(StoreError::Write("flash full".to_string()));
            }
            self.writes += 1;
            self.blob = Some(blob.to_vec());
            Ok(())
        }
    }
}
