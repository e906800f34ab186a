use anyhow::{Result, anyhow};
use std::{collections::BTreeMap, fs, io, path::Path};

/// Load overrides for the managed server's environment from a .env-style file,
/// tolerating comments, blank lines and `export` prefixes.
pub fn load_env_overrides(path: &Path) -> Result<BTreeMap<String, String>> {
    parse_lenient_dotenv(path).map_err(|error| {
        anyhow!(
            "failed to parse environment overrides from {:?}: {error}",
            path
        )
    })
}

fn parse_lenient_dotenv(path: &Path) -> io::Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    let contents = fs::read_to_string(path)?;

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        if !key.chars().all(is_env_key_char) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "invalid environment variable name `{}` at line {}",
                    key,
                    idx + 1
                ),
            ));
        }

        map.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(map)
}

fn is_env_key_char(ch: char) -> bool {
    ch == '_' || ch.is_ascii_alphanumeric()
}

fn strip_quotes(value: &str) -> String {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_comments_quotes_and_exports() -> Result<()> {
        let file = NamedTempFile::new()?;
        fs::write(
            file.path(),
            "# server env\nMONGODB_URI=\"mongodb://localhost\"\n\n\
             export LOG_LEVEL = debug\nEMPTY=\nnot a pair\n",
        )?;
        let overrides = load_env_overrides(file.path())?;
        assert_eq!(
            overrides.get("MONGODB_URI"),
            Some(&"mongodb://localhost".to_string())
        );
        assert_eq!(overrides.get("LOG_LEVEL"), Some(&"debug".to_string()));
        assert_eq!(overrides.get("EMPTY"), Some(&String::new()));
        assert_eq!(overrides.len(), 3);
        Ok(())
    }

    #[test]
    fn rejects_invalid_names() -> Result<()> {
        let file = NamedTempFile::new()?;
        fs::write(file.path(), "BAD-NAME=value\n")?;
        let error = load_env_overrides(file.path()).unwrap_err();
        assert!(error.to_string().contains("BAD-NAME"));
        Ok(())
    }
}
