/// Errors produced while building, verifying or decoding protocol frames.
///
/// Every variant is recoverable from the caller's point of view: a failed
/// verify or decode only affects the frame it was called on, the stream
/// reassembler keeps resynchronizing on subsequent bytes.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Candidate is shorter than the smallest possible frame.
    #[error("frame too short ({0} characters)")]
    ShortFrame(usize),
    /// Candidate does not begin with the `~` start marker.
    #[error("missing start marker")]
    MissingStartMarker,
    /// The nibble checksum embedded in the length word does not match LENID.
    #[error("length checksum mismatch (expected {expected:X}, got {got:X})")]
    BadLengthChecksum { expected: u8, got: u8 },
    /// The trailing 16-bit checksum does not match the frame body.
    #[error("frame checksum mismatch (expected {expected:04X}, got {got:04X})")]
    BadFrameChecksum { expected: u16, got: u16 },
    /// LENID declares a payload length different from what the frame carries.
    #[error("declared payload length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// A header or payload field contains a non-hexadecimal character.
    #[error("non-hex character in frame field")]
    InvalidHex,
    /// Encode-side contract violation: payload would overflow the 12-bit
    /// length field (2047 bytes / 4095 hex characters).
    #[error("payload of {0} bytes exceeds the 12-bit length field")]
    OversizedPayload(usize),
    /// Service id is not in the supported set and no request-context hint
    /// was available to resolve the response.
    #[error("unknown service 0x{0:02X} and no request context hint")]
    UnknownService(u8),
    /// The device answered with a non-zero RTN status code.
    #[error("device returned status 0x{code:02X}")]
    ResponseNotOk { code: u8 },
    /// The cell-voltage alignment search found no offset scoring above the
    /// plausibility minimum.
    #[error("no plausible cell voltage alignment (best run of {best} at offset {offset})")]
    AmbiguousAlignment { offset: usize, best: usize },
    /// The payload is too short for the fixed layout of the given service.
    #[error("payload truncated for service 0x{service:02X} (need {needed} bytes, got {got})")]
    TruncatedPayload {
        service: u8,
        needed: usize,
        got: usize,
    },
}
