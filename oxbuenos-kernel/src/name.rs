use core::fmt;

/// A NUL-free byte string of at most `N - 1` bytes, stored inline.
/// Used for executable paths and semaphore names, which live in fixed tables.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedName<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedName<N> {
    pub const EMPTY: Self = Self {
        bytes: [0; N],
        len: 0,
    };

    /// Copy `name` up to its first NUL, truncated to `N - 1` bytes
    #[must_use]
    pub fn new(name: &[u8]) -> Self {
        let end = name.iter().position(|&byte| byte == 0).unwrap_or(name.len());
        let len = core::cmp::min(end, N.saturating_sub(1));
        let mut bytes = [0; N];
        bytes[..len].copy_from_slice(&name[..len]);
        Self { bytes, len }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The longest prefix that is valid UTF-8
    #[must_use]
    pub fn as_str(&self) -> &str {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(name) => name,
            Err(err) => core::str::from_utf8(&self.as_bytes()[..err.valid_up_to()]).unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Compare against `name` as it would be stored
    #[must_use]
    pub fn matches(&self, name: &[u8]) -> bool {
        *self == Self::new(name)
    }
}

impl<const N: usize> Default for FixedName<N> {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl<const N: usize> fmt::Debug for FixedName<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}
