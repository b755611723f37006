//! SHARDLINE - Conflict Resolution Hook
//! Strategy invoked on the callback write path with the current and incoming
//! values; it computes the value actually written, or vetoes the write.

use bytes::Bytes;

use crate::types::Value;

/// Outcome of a resolver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Publish this value.
    Write(Value),
    /// Drop the write: nothing is cached or published.
    Veto,
}

/// Injected write-time merge strategy.
///
/// Implementations inspect the values they are given and must not reach into
/// partition state themselves.
pub trait ConflictResolver: Send + Sync {
    /// Whether callback writes should go through `resolve` at all.
    fn needs_callback(&self) -> bool {
        true
    }

    /// Compute the value to write for `key`.
    fn resolve(&self, key: &[u8], current: Option<&[u8]>, incoming: &[u8]) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&[u8], Option<&[u8]>, &[u8]) -> Resolution + Send + Sync,
{
    fn resolve(&self, key: &[u8], current: Option<&[u8]>, incoming: &[u8]) -> Resolution {
        self(key, current, incoming)
    }
}

/// Treats values as little-endian `i64` counters and adds the incoming delta.
///
/// A malformed delta or stored value vetoes the write.
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterResolver;

impl CounterResolver {
    pub fn encode(n: i64) -> Value {
        Bytes::copy_from_slice(&n.to_le_bytes())
    }

    pub fn decode(raw: &[u8]) -> Option<i64> {
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(i64::from_le_bytes(bytes))
    }
}

impl ConflictResolver for CounterResolver {
    fn resolve(&self, key: &[u8], current: Option<&[u8]>, incoming: &[u8]) -> Resolution {
        let delta = match Self::decode(incoming) {
            Some(delta) => delta,
            None => {
                log::warn!("counter delta for {:?} is not 8 bytes, vetoing", key);
                return Resolution::Veto;
            }
        };
        let base = match current {
            None => 0,
            Some(raw) => match Self::decode(raw) {
                Some(n) => n,
                None => {
                    log::warn!("stored counter for {:?} is not 8 bytes, vetoing", key);
                    return Resolution::Veto;
                }
            },
        };
        Resolution::Write(Self::encode(base.wrapping_add(delta)))
    }
}

/// Keeps the first value ever written to a key; later callback writes are vetoed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstWriteWins;

impl ConflictResolver for FirstWriteWins {
    fn resolve(&self, _key: &[u8], current: Option<&[u8]>, incoming: &[u8]) -> Resolution {
        match current {
            Some(_) => Resolution::Veto,
            None => Resolution::Write(Bytes::copy_from_slice(incoming)),
        }
    }
}
