//! On-disk path conventions shared by the coordinator and the agents.

pub const CERT_PATH_PREFIX: &str = "/data/cdn/certs/";
pub const CERT_FILE_NAME: &str = "cert.pem";
pub const CERT_KEY_NAME: &str = "key.pem";
pub const CERT_INTERMEDIATE_NAME: &str = "ca.pem";

pub const AFILE_PATH_PREFIX: &str = "/data/cdn/afiles/";

/// Directory holding a cert's material, trailing slash included.
pub fn cert_dir(cert_id: i64) -> String {
    format!("{CERT_PATH_PREFIX}{cert_id}/")
}

pub fn cert_leaf_path(cert_id: i64) -> String {
    format!("{}{}", cert_dir(cert_id), CERT_FILE_NAME)
}

pub fn cert_key_path(cert_id: i64) -> String {
    format!("{}{}", cert_dir(cert_id), CERT_KEY_NAME)
}

pub fn cert_intermediate_path(cert_id: i64) -> String {
    format!("{}{}", cert_dir(cert_id), CERT_INTERMEDIATE_NAME)
}

pub fn additional_file_path(filename: &str) -> String {
    format!("{AFILE_PATH_PREFIX}{filename}")
}
