//! Credential capabilities the session controller consumes.
//!
//! PIN values travel in [`Zeroizing`] buffers and are wiped as soon as
//! the verify command has been built.

use zeroize::Zeroizing;

use crate::{Error, Result};

/// Source of PIN values.
///
/// A cached source (a static credential, or a prompt that remembered its
/// last answer) must never be resubmitted blindly after a wrong-PIN
/// status: doing so would silently exhaust the retry counter. The
/// controller calls [`PinSource::reset`] before asking again.
pub trait PinSource {
    /// Produce a PIN. `retries_left` is present when the card reported a
    /// remaining-attempt count, so a prompt can display it.
    fn request(&mut self, retries_left: Option<u8>) -> Result<Zeroizing<String>>;

    /// Discard any cached value; the next [`PinSource::request`] must
    /// consult the user again. Sources with nothing to discard report
    /// [`Error::PinSourceUnavailable`].
    fn reset(&mut self) -> Result<()>;

    /// Whether this source replays a stored value rather than consulting
    /// the user per call.
    fn is_cached(&self) -> bool {
        false
    }
}

/// Fixed credential supplied by the calling application.
pub struct StaticPin(Zeroizing<String>);

impl StaticPin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(Zeroizing::new(pin.into()))
    }
}

impl PinSource for StaticPin {
    fn request(&mut self, _retries_left: Option<u8>) -> Result<Zeroizing<String>> {
        Ok(self.0.clone())
    }

    fn reset(&mut self) -> Result<()> {
        // A fixed value cannot be re-derived.
        Err(Error::PinSourceUnavailable)
    }

    fn is_cached(&self) -> bool {
        true
    }
}

/// Prompting source backed by a closure; each request consults the user.
pub struct PinPrompt<F>(F);

impl<F> PinPrompt<F>
where
    F: FnMut(Option<u8>) -> Result<Zeroizing<String>>,
{
    pub fn new(prompt: F) -> Self {
        Self(prompt)
    }
}

impl<F> PinSource for PinPrompt<F>
where
    F: FnMut(Option<u8>) -> Result<Zeroizing<String>>,
{
    fn request(&mut self, retries_left: Option<u8>) -> Result<Zeroizing<String>> {
        (self.0)(retries_left)
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Authorization decision for a pending signature.
pub trait SignConfirmation {
    /// `description` names the operation being authorized. `false` means
    /// the user declined; cancellation surfaces as [`Error::Cancelled`].
    fn confirm(&mut self, description: &str) -> Result<bool>;
}

impl<F> SignConfirmation for F
where
    F: FnMut(&str) -> Result<bool>,
{
    fn confirm(&mut self, description: &str) -> Result<bool> {
        self(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_pin_is_cached_and_cannot_reset() {
        let mut source = StaticPin::new("1234");
        assert!(source.is_cached());
        assert_eq!(source.request(None).unwrap().as_str(), "1234");
        assert!(matches!(source.reset(), Err(Error::PinSourceUnavailable)));
    }

    #[test]
    fn prompt_sees_the_retry_count() {
        let mut seen = Vec::new();
        {
            let mut source = PinPrompt::new(|retries| {
                seen.push(retries);
                Ok(Zeroizing::new("0000".to_string()))
            });
            source.request(Some(2)).unwrap();
            source.reset().unwrap();
            source.request(Some(1)).unwrap();
        }
        assert_eq!(seen, vec![Some(2), Some(1)]);
    }
}
