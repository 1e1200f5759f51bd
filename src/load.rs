//! Role message loading. A role entry may be a literal string, a
//! `file://` path, or an `http(s)://` URL.

use crate::error::ModsError;

pub async fn load_msg(msg: &str) -> Result<String, ModsError> {
    if msg.starts_with("https://") || msg.starts_with("http://") {
        let resp = reqwest::get(msg)
            .await
            .map_err(|err| ModsError::new("Could not fetch the role message.", err))?;
        return resp
            .text()
            .await
            .map_err(|err| ModsError::new("Could not fetch the role message.", err));
    }

    if let Some(path) = msg.strip_prefix("file://") {
        return std::fs::read_to_string(path)
            .map_err(|err| ModsError::new("Could not read the role message file.", err));
    }

    Ok(msg.to_string())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn literal_strings_pass_through() {
        assert_eq!(load_msg("be terse").await.unwrap(), "be terse");
    }

    #[tokio::test]
    async fn file_urls_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "you are a shell expert").unwrap();
        let url = format!("file://{}", file.path().display());
        assert_eq!(load_msg(&url).await.unwrap(), "you are a shell expert");
    }

    #[tokio::test]
    async fn missing_files_error() {
        assert!(load_msg("file:///does/not/exist").await.is_err());
    }
}
