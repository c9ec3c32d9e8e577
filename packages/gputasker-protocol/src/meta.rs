use serde::{Deserialize, Deserializer, Serialize};

/// Metadata file a launched workload writes to
/// `~/.gputasker/running_tasks/<log_id>.json`.
///
/// The writing side is a shell here-doc, so numeric fields arrive as JSON
/// strings (`"remote_pid":"4321"`); both encodings are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningTaskMeta {
    #[serde(deserialize_with = "int_or_string")]
    pub running_log_id: i64,
    #[serde(default, deserialize_with = "opt_int_or_string")]
    pub remote_pid: Option<i64>,
    #[serde(default, deserialize_with = "opt_int_or_string")]
    pub remote_pgid: Option<i64>,
    #[serde(default, deserialize_with = "opt_int_or_string")]
    pub timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrString {
    Int(i64),
    Str(String),
}

fn int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(v) => Ok(v),
        IntOrString::Str(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
    }
}

fn opt_int_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match Option::<IntOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IntOrString::Int(v)) => Ok(Some(v)),
        // A torn shell expansion writes an empty string; treat it as absent.
        Some(IntOrString::Str(s)) => Ok(s.trim().parse::<i64>().ok()),
    }
}
