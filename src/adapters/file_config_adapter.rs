//! INI file configuration adapter.

use crate::domain::error::QtsimError;
use crate::ports::config_port::ConfigPort;
use configparser::ini::Ini;
use std::path::Path;

/// Only `#` starts a comment: `;` separates strategies within an operator role.
const COMMENT_SYMBOLS: [char; 1] = ['#'];

#[derive(Debug)]
pub struct FileConfigAdapter {
    config: Ini,
}

fn new_ini() -> Ini {
    let mut config = Ini::new();
    config.set_comment_symbols(&COMMENT_SYMBOLS);
    config
}

impl FileConfigAdapter {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, QtsimError> {
        let path = path.as_ref();
        let mut config = new_ini();
        config.load(path).map_err(|reason| QtsimError::ConfigParse {
            file: path.display().to_string(),
            reason,
        })?;
        Ok(Self { config })
    }

    pub fn from_string(content: &str) -> Result<Self, QtsimError> {
        let mut config = new_ini();
        config
            .read(content.to_string())
            .map_err(|reason| QtsimError::ConfigParse {
                file: "<inline>".to_string(),
                reason,
            })?;
        Ok(Self { config })
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.config
            .sections()
            .iter()
            .any(|s| s.eq_ignore_ascii_case(section))
    }
}

impl ConfigPort for FileConfigAdapter {
    fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.config.get(section, key)
    }
}
