use core::pin::Pin;

/// Construct a `Pin<&'static T>` from a `&'static T`.
///
/// A `'static` reference's pointee can never be invalidated, hence it's
/// always safe to pin.
#[inline]
pub(crate) fn static_pin<T>(x: &'static T) -> Pin<&'static T> {
    // Safety: See above
    unsafe { Pin::new_unchecked(x) }
}
