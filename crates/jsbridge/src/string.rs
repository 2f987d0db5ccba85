//! External UTF-16 string buffers.
//!
//! Wraps a buffer of UTF-16 characters so it can be handed to the engine for
//! string materialization without the host copying it on every crossing. A
//! buffer is either owned by the proxy (copied in from a host string) or
//! shared with the caller through a reference count; the distinction decides
//! what `clear` releases.

use std::sync::Arc;

use deno_core::v8;

/// A UTF-16 character buffer exposed to the script engine.
///
/// Move-only by design: a plain copy would leave two owners for one buffer.
/// Use [`ExternalUtf16::share`] to create a second proxy over the same shared
/// storage.
#[derive(Debug)]
pub struct ExternalUtf16 {
    chars: Option<Arc<[u16]>>,
}

impl ExternalUtf16 {
    /// Wraps an existing caller-retained buffer without copying.
    pub fn from_utf16(chars: Arc<[u16]>) -> Self {
        Self { chars: Some(chars) }
    }

    /// Copies `src` into a buffer owned by the proxy.
    pub fn copy_from(src: &str) -> Self {
        let chars: Vec<u16> = src.encode_utf16().collect();
        Self {
            chars: Some(chars.into()),
        }
    }

    /// The character data, empty once cleared.
    pub fn data(&self) -> &[u16] {
        self.chars.as_deref().unwrap_or(&[])
    }

    /// Number of UTF-16 code units.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detaches the buffer. `free_data` is advisory: the proxy only ever
    /// releases its own reference, so a buffer shared via
    /// [`share`](Self::share) or [`from_utf16`](Self::from_utf16) stays alive
    /// for its other owners and a double-free cannot occur. Safe to call more
    /// than once; a cleared proxy reads as empty.
    pub fn clear(&mut self, free_data: bool) {
        let _ = free_data;
        self.chars.take();
    }

    /// A second proxy over the same storage. Reference-counted sharing, never
    /// a byte copy.
    pub fn share(&self) -> Self {
        Self {
            chars: self.chars.clone(),
        }
    }

    /// Decodes into a host string, replacing unpaired surrogates.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(self.data())
    }

    /// Materializes the buffer as an engine string. Runtime thread only.
    pub(crate) fn materialize<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
    ) -> Option<v8::Local<'s, v8::String>> {
        if self.is_empty() {
            return v8::String::new(scope, "");
        }
        v8::String::new_from_two_byte(scope, self.data(), v8::NewStringType::Normal)
    }
}

impl PartialEq for ExternalUtf16 {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_from_roundtrips() {
        let s = ExternalUtf16::copy_from("hoppär");
        assert_eq!(s.to_string_lossy(), "hoppär");
        assert_eq!(s.len(), 6);
    }

    #[test]
    fn from_utf16_shares_without_copy() {
        let buf: Arc<[u16]> = "shared".encode_utf16().collect::<Vec<u16>>().into();
        let s = ExternalUtf16::from_utf16(buf.clone());
        assert_eq!(s.data().as_ptr(), buf.as_ptr());
    }

    #[test]
    fn clear_is_idempotent_and_empties() {
        let mut s = ExternalUtf16::copy_from("x");
        s.clear(true);
        assert!(s.is_empty());
        s.clear(true);
        assert!(s.is_empty());
        assert_eq!(s.to_string_lossy(), "");
    }

    #[test]
    fn clear_without_free_keeps_shared_storage() {
        let buf: Arc<[u16]> = "keep".encode_utf16().collect::<Vec<u16>>().into();
        let mut s = ExternalUtf16::from_utf16(buf.clone());
        s.clear(false);
        assert!(s.is_empty());
        assert_eq!(String::from_utf16_lossy(&buf), "keep");
    }

    #[test]
    fn share_reads_the_same_buffer() {
        let a = ExternalUtf16::copy_from("twin");
        let b = a.share();
        assert_eq!(a, b);
        assert_eq!(a.data().as_ptr(), b.data().as_ptr());
    }
}
