use std::fmt;
use std::str::FromStr;

/// Size of every application, context and ECU identifier on the wire.
pub const ID_SIZE: usize = 4;

/// A 4-byte ASCII identifier, NUL-padded.
///
/// Ordering and equality compare all four bytes, which is what keeps the
/// registry's sorted tables consistent with the wire representation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id4([u8; ID_SIZE]);

impl Id4 {
    pub const EMPTY: Id4 = Id4([0; ID_SIZE]);

    /// Build from text, truncating after four bytes and padding with NUL.
    pub fn new(text: &str) -> Self {
        let mut raw = [0u8; ID_SIZE];
        for (dst, src) in raw.iter_mut().zip(text.bytes()) {
            *dst = src;
        }
        Self(raw)
    }

    pub const fn from_bytes(raw: [u8; ID_SIZE]) -> Self {
        Self(raw)
    }

    /// Read the first four bytes of `src`. Callers check the length.
    pub(crate) fn from_slice(src: &[u8]) -> Self {
        let mut raw = [0u8; ID_SIZE];
        raw.copy_from_slice(&src[..ID_SIZE]);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    /// The significant bytes, up to the first NUL.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(ID_SIZE);
        &self.0[..end]
    }

    /// Wildcard prefix when the identifier ends in `*` (`"AB*"` → `"AB"`).
    pub fn wildcard_prefix(&self) -> Option<&[u8]> {
        self.trimmed().strip_suffix(b"*")
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.trimmed().starts_with(prefix)
    }
}

impl FromStr for Id4 {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl fmt::Display for Id4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for Id4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id4({:?})", self.to_string())
    }
}
