use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::rpc::protocol::RpcError;

/// A typed parameter set. `FIELDS` lists the struct's fields in declaration
/// order and drives positional binding. Implementors are expected to carry
/// `#[serde(default)]` so short arrays leave the tail zero-valued.
pub trait RpcParams: DeserializeOwned {
    const FIELDS: &'static [&'static str];
}

/// For methods that take nothing.
#[derive(Debug, Default, Deserialize)]
pub struct NoParams {}

impl RpcParams for NoParams {
    const FIELDS: &'static [&'static str] = &[];
}

/// Binds raw `params` onto `T`: objects by name, arrays by position (extra
/// items ignored), a scalar onto the first field, absent or null as empty.
pub fn bind_params<T: RpcParams>(params: Option<Value>) -> Result<T, RpcError> {
    let object = match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::Array(items)) => Value::Object(
            T::FIELDS
                .iter()
                .zip(items)
                .map(|(name, item)| ((*name).to_owned(), item))
                .collect(),
        ),
        Some(scalar) => {
            let mut map = Map::new();
            if let Some(first) = T::FIELDS.first() {
                map.insert((*first).to_owned(), scalar);
            }
            Value::Object(map)
        }
    };
    serde_json::from_value(object).map_err(RpcError::invalid_params)
}
