use sha2::{Digest, Sha256};

/// Sticky rollout bucket in [0, 100). The same (user, flag, version) triple
/// always lands in the same bucket, so a user's rollout assignment does not
/// flip between evaluations.
pub fn bucket_for(flag_key: &str, user_id: &str, version: u64) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}_{}_{}", flag_key, user_id, version));
    let res = hasher.finalize();
    let word = u32::from_be_bytes([
        *res.first().unwrap_or(&0),
        *res.get(1).unwrap_or(&0),
        *res.get(2).unwrap_or(&0),
        *res.get(3).unwrap_or(&0),
    ]);
    word % 100
}

/// Numeric view of a JSON value, with numeric-string coercion.
pub fn get_numeric_value(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// String view of a JSON value. Only scalars have one; arrays and objects
/// yield None so string comparators treat them as a type mismatch.
pub fn get_string_value(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
