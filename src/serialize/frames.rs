//! Serialize a fixed array of return addresses as a list of hex strings,
//! stopping at the first null frame. Deserializing pads the tail back out with
//! nulls.

use std::fmt;

use serde::{
    de::{self, SeqAccess, Visitor},
    ser::SerializeSeq,
    Deserializer, Serializer,
};

pub fn serialize<S, const N: usize>(frames: &[usize; N], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let depth = frames.iter().position(|&ip| ip == 0).unwrap_or(N);
    let mut seq = serializer.serialize_seq(Some(depth))?;
    for ip in &frames[..depth] {
        seq.serialize_element(&format!("{ip:#x}"))?;
    }
    seq.end()
}

pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[usize; N], D::Error>
where
    D: Deserializer<'de>,
{
    struct V<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for V<N> {
        type Value = [usize; N];

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "at most {N} hex return addresses")
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut frames = [0usize; N];
            let mut depth = 0;
            while let Some(ip) = seq.next_element::<String>()? {
                if depth == N {
                    return Err(de::Error::invalid_length(depth + 1, &self));
                }
                let digits = ip.strip_prefix("0x").unwrap_or(&ip);
                frames[depth] = usize::from_str_radix(digits, 16)
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&ip), &self))?;
                depth += 1;
            }
            Ok(frames)
        }
    }

    deserializer.deserialize_seq(V::<N>)
}
