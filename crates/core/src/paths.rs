use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".qqgate"))
            .unwrap_or_else(|| PathBuf::from(".qqgate"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base.join("sessions")
    }

    pub fn session_file(&self, account_id: &str) -> PathBuf {
        let safe_key = account_id.replace([':', '/', '\\'], "_");
        self.sessions_dir().join(format!("{}.json", safe_key))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_file_sanitizes_key() {
        let paths = Paths::with_base(PathBuf::from("/tmp/qqgate-test"));
        let file = paths.session_file("acct:1/x");
        assert_eq!(file.file_name().unwrap(), "acct_1_x.json");
    }
}
