//! Upload records
//!
//! One record per upload session. The canonical uploader is held to a minimum
//! client version; other clients are accepted as-is.

use crate::datum::{get_str, Datum};
use crate::error::{IngestError, Result};
use crate::registry::{DatumType, Transform, TypeRegistry, TypeSpec};
use crate::validation::{array, if_exists, string, FieldSchema};
use crate::version::{parse_minimum, ClientVersion};

use super::TransformContext;

pub const OUTDATED_VERSION: &str = "outdatedVersion";

pub(crate) fn register(registry: &mut TypeRegistry) -> Result<()> {
    registry.register(
        DatumType::Upload,
        TypeSpec::new(
            FieldSchema::new()
                .field("version", string())
                .field("uploadId", string())
                .field("byUser", if_exists(string()))
                .field("deviceTags", if_exists(array()))
                .field("deviceManufacturers", if_exists(array()))
                .field("deviceModel", if_exists(string()))
                .field("deviceSerialNumber", if_exists(string()))
                .field("timeProcessing", if_exists(string())),
            &["type", "uploadId"],
            Transform::UploadVersion,
        ),
    )
}

pub(crate) fn check_version(datum: Datum, ctx: &TransformContext<'_>) -> Result<Vec<Datum>> {
    let settings = &ctx.config.upload;
    let client = match get_str(&datum, "version").and_then(ClientVersion::parse) {
        Some(client) if client.is_client(&settings.uploader_name) => client,
        _ => return Ok(vec![datum]),
    };

    let minimum = parse_minimum(&settings.minimum_version)
        .map_err(|e| IngestError::Registration(format!("upload.minimum_version: {}", e)))?;
    if !client.meets(&minimum) {
        return Err(IngestError::BusinessRule {
            code: OUTDATED_VERSION.to_string(),
            field: "version".to_string(),
            message: format!(
                "The minimum supported version is [{}]. Version [{}] is no longer supported.",
                minimum, client
            ),
        });
    }
    Ok(vec![datum])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::testing::{run, FakeLookup};
    use serde_json::json;

    fn upload(version: &str) -> serde_json::Value {
        json!({
            "type": "upload",
            "version": version,
            "uploadId": "upid_1234",
            "byUser": "u1",
            "deviceTags": ["insulin-pump"],
            "deviceId": "pump-1",
            "time": "2014-01-01T00:00:00Z",
            "_groupId": "g1"
        })
    }

    #[tokio::test]
    async fn test_outdated_uploader_rejected() {
        let err = run(&FakeLookup::default(), upload("tidepool-uploader 0.98.9")).await.unwrap_err();
        let body = err.to_body();
        assert_eq!(body.status_code, 400);
        assert_eq!(body.code.as_deref(), Some(OUTDATED_VERSION));
        assert_eq!(body.error_field.as_deref(), Some("version"));
    }

    #[tokio::test]
    async fn test_current_uploader_accepted() {
        let out = run(&FakeLookup::default(), upload("tidepool-uploader 0.99.0")).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_uploader_without_version_rejected() {
        assert!(run(&FakeLookup::default(), upload("tidepool-uploader")).await.is_err());
    }

    #[tokio::test]
    async fn test_other_clients_not_gated() {
        let out = run(&FakeLookup::default(), upload("third-party-sync 0.1.0")).await.unwrap();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_id_keyed_on_upload_id() {
        let a = run(&FakeLookup::default(), upload("third-party-sync 0.1.0")).await.unwrap();
        let mut later = upload("third-party-sync 0.1.0");
        later["time"] = json!("2015-06-01T00:00:00Z");
        let b = run(&FakeLookup::default(), later).await.unwrap();
        assert_eq!(a[0]["id"], b[0]["id"]);
    }
}
