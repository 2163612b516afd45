//! Data model shared by the stores, the reconciler and the ingestion path.

mod flow;
mod snapshot;
mod status;
mod step;

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

pub use flow::*;
pub use snapshot::*;
pub use status::*;
pub use step::*;

/// Attribute bag written by the engine: a schema-less key/value container.
pub type Attrs = HashMap<String, serde_json::Value>;

/// Treat an explicit JSON `null` like a missing field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
