/// Key layout for the keyspace partitions.
///
/// Partition structure:
/// - `jobs`: job:{job_id} -> Job (JSON)
/// - `assets`: asset:{job_id}:{asset_id} -> Asset (JSON)
/// - `templates`: tpl:{template_id} -> Template (JSON)
/// - `settings`: settings -> Settings (JSON)
/// - `error_logs`: err:{job_id}:{error_id} -> ErrorReport (JSON)
/// - `meta`: schema_version -> u32 (string)
///
/// Job, asset and error ids are UUIDv7, so prefix scans come back in
/// creation order.
pub const SETTINGS_KEY: &[u8] = b"settings";
pub const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{job_id}").into_bytes()
}

pub fn encode_asset_key(job_id: &str, asset_id: &str) -> Vec<u8> {
    format!("asset:{job_id}:{asset_id}").into_bytes()
}

/// Prefix for a range scan over one job's assets.
pub fn encode_asset_prefix(job_id: &str) -> Vec<u8> {
    format!("asset:{job_id}:").into_bytes()
}

/// Decode an asset key back into (job_id, asset_id).
pub fn decode_asset_key(key: &[u8]) -> Option<(String, String)> {
    let key_str = std::str::from_utf8(key).ok()?;
    let rest = key_str.strip_prefix("asset:")?;
    let (job_id, asset_id) = rest.split_once(':')?;
    if job_id.is_empty() || asset_id.is_empty() {
        return None;
    }
    Some((job_id.to_string(), asset_id.to_string()))
}

pub fn encode_template_key(template_id: &str) -> Vec<u8> {
    format!("tpl:{template_id}").into_bytes()
}

pub fn encode_error_key(job_id: &str, error_id: &str) -> Vec<u8> {
    format!("err:{job_id}:{error_id}").into_bytes()
}

pub fn encode_error_prefix(job_id: &str) -> Vec<u8> {
    format!("err:{job_id}:").into_bytes()
}
