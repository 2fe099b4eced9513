//! HTTP upload for report sinks.

use std::path::Path;
use std::time::Duration;

use crate::error::UtilError;

/// POST the contents of `path` to `url`, optionally authenticated with a bearer token.
///
/// Returns the HTTP status code of the (successful) response.
///
/// # Errors
/// Returns an error if the file cannot be read, the request fails, or the
/// server answers with a 4xx/5xx status.
pub fn upload_file(
    url: &str,
    path: &Path,
    content_type: &str,
    token: Option<&str>,
) -> Result<u16, UtilError> {
    let data = std::fs::read(path).map_err(|source| UtilError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let agent = ureq::Agent::new_with_config(
        ureq::config::Config::builder()
            .timeout_connect(Some(Duration::from_secs(30)))
            .timeout_global(Some(Duration::from_secs(300)))
            .build(),
    );

    let mut request = agent.post(url).header("Content-Type", content_type);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }

    let response = request
        .send(data.as_slice())
        .map_err(|e| UtilError::Upload {
            url: url.to_owned(),
            message: e.to_string(),
        })?;

    Ok(response.status().as_u16())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn upload_missing_file_is_io_error() {
        let result = upload_file(
            "http://127.0.0.1:9/upload",
            Path::new("/nonexistent/report.json"),
            "application/json",
            None,
        );
        assert!(matches!(result, Err(UtilError::Io { .. })));
    }

    #[test]
    fn upload_to_closed_port_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("report.json");
        std::fs::write(&file, b"{}").unwrap();

        let result = upload_file("http://127.0.0.1:9/upload", &file, "application/json", Some("t"));
        assert!(matches!(result, Err(UtilError::Upload { .. })));
    }
}
