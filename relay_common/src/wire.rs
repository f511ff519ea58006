//! Serde adapters for envelope fields that have no native JSON shape.

/// `HeaderMap` as `{ "name": ["v1", "v2"] }`, preserving per-name value order.
///
/// Values are mapped byte-for-char as Latin-1 so obs-text bytes (0x80-0xFF)
/// survive the trip.
pub(crate) mod header_multimap {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use serde::de::Error as _;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(headers.keys_len()))?;
        for name in headers.keys() {
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|v| v.as_bytes().iter().map(|&b| b as char).collect())
                .collect();
            map.serialize_entry(name.as_str(), &values)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let raw = Option::<BTreeMap<String, Vec<String>>>::deserialize(deserializer)?;
        let mut headers = HeaderMap::new();
        for (name, values) in raw.unwrap_or_default() {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(D::Error::custom)?;
            for value in values {
                let bytes = value
                    .chars()
                    .map(|c| {
                        u8::try_from(c).map_err(|_| {
                            D::Error::custom(format!("header value char {:?} is not Latin-1", c))
                        })
                    })
                    .collect::<Result<Vec<u8>, _>>()?;
                let value = HeaderValue::from_bytes(&bytes).map_err(D::Error::custom)?;
                headers.append(name.clone(), value);
            }
        }
        Ok(headers)
    }
}

/// Byte bodies (`Bytes` or `BytesMut`) as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(body: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(body.as_ref()))
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: From<Bytes>,
        D: Deserializer<'de>,
    {
        let bytes = match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(D::Error::custom)?,
            None => Bytes::new(),
        };
        Ok(T::from(bytes))
    }
}
