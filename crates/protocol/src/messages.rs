use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Asks whether an artifact exists, or which chunks are already staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    pub fingerprint: String,
    pub artifact_name: String,
}

/// Header preceding a raw chunk body in a frame.
///
/// `size` is the exact byte length of the body that follows the envelope,
/// so the receiver opens the staging file before touching the payload.
/// `checksum` is an optional SHA-256 hex digest of the body; when present
/// the server verifies it before committing the chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub fingerprint: String,
    pub index: u32,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

/// Requests assembly of all staged chunks into the named artifact.
///
/// `total_size` is advisory; only `total_chunks` gates the merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    pub fingerprint: String,
    pub artifact_name: String,
    pub total_chunks: u32,
    #[serde(default)]
    pub total_size: u64,
}

/// Deletes one staged chunk (client-driven cancellation cleanup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    pub fingerprint: String,
    pub index: u32,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Status resolution result.
///
/// When `exists` is true the artifact is complete and `location` is set;
/// otherwise `stored_indices` lists the chunk indices already staged
/// (decimal strings on the wire — ordering is always numeric, never
/// lexicographic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stored_indices: Vec<String>,
}

/// Acknowledges one stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub fingerprint: String,
    pub index: u32,
    pub bytes_written: u64,
}

/// Successful merge result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub location: String,
}

/// Structured detail attached to a chunk-count-mismatch error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MismatchDetail {
    pub expected: u32,
    pub actual: u32,
}

/// Generic operation acknowledgement (cleanup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_request_camel_case() {
        let req = StatusRequest {
            fingerprint: "deadbeef".into(),
            artifact_name: "movie.mkv".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"artifactName\""));
        let parsed: StatusRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn chunk_header_omits_empty_checksum() {
        let header = ChunkHeader {
            fingerprint: "fp".into(),
            index: 7,
            size: 1024,
            checksum: String::new(),
        };
        let json = serde_json::to_string(&header).unwrap();
        assert!(!json.contains("checksum"));

        let parsed: ChunkHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.checksum, "");
        assert_eq!(parsed.index, 7);
    }

    #[test]
    fn status_response_partial() {
        let resp = StatusResponse {
            exists: false,
            location: None,
            stored_indices: vec!["0".into(), "2".into(), "10".into()],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("location"));
        assert!(json.contains("storedIndices"));
        let parsed: StatusResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stored_indices.len(), 3);
    }

    #[test]
    fn status_response_complete_omits_indices() {
        let resp = StatusResponse {
            exists: true,
            location: Some("artifacts/movie.mkv".into()),
            stored_indices: vec![],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("storedIndices"));
    }

    #[test]
    fn merge_request_defaults_total_size() {
        let json = r#"{"fingerprint":"fp","artifactName":"a.bin","totalChunks":3}"#;
        let parsed: MergeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.total_chunks, 3);
        assert_eq!(parsed.total_size, 0);
    }
}
