//! JSON helpers for configuration documents shipped with the service

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, error};

/// Deserialize a JSON string
pub fn deserialize<T: DeserializeOwned>(json: &str) -> Result<T> {
    Ok(serde_json::from_str(json)?)
}

/// Deserialize JSON read from a stream
pub fn from_reader<T: DeserializeOwned, R: Read>(reader: R) -> Result<T> {
    Ok(serde_json::from_reader(reader)?)
}

/// Serialize a value to a JSON string
pub fn stringify<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn read_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    from_reader(BufReader::new(file))
}

/// Read the configured document, falling back to the default one.
///
/// A missing, empty or unparsable configured path is logged and the default
/// is used instead. Failing to read the default is an error.
pub fn read_configured_or_default<T: DeserializeOwned>(
    configured: Option<&Path>,
    default: &Path,
) -> Result<T> {
    if let Some(path) = configured.filter(|p| !p.as_os_str().is_empty()) {
        debug!("Loading JSON from {}", path.display());
        match read_file(path) {
            Ok(value) => return Ok(value),
            Err(e) => error!(
                "Error reading {} from {}: {}",
                std::any::type_name::<T>(),
                path.display(),
                e
            ),
        }
    }

    debug!("Falling back to default JSON {}", default.display());
    read_file(default).map_err(|e| {
        error!("Could not load the default JSON {}: {}", default.display(), e);
        Error::DefaultJsonMissing {
            path: default.to_path_buf(),
            reason: e.to_string(),
        }
    })
}
