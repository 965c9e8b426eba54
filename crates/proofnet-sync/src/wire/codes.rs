//! Message codes.
//!
//! Every message class has a stable code. Codes never change meaning; new
//! messages take new codes. A peer that receives a code it does not know can
//! still skip the frame because the length travels in the header.

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 2;

/// Oldest protocol version we still talk to.
pub const MIN_PROTOCOL_VERSION: u16 = 1;

/// Closed set of message codes this implementation understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageCode {
    // Connection bootstrap
    Salutation = 0x0001,
    Splice = 0x0002,

    // Sub-root selection
    SubRootRequest = 0x0010,
    SubRootResponse = 0x0011,

    // Distributed lock
    LockInit = 0x0020,
    LockRequest = 0x0021,
    LockResponse = 0x0022,

    // Symmetric selection
    SelectionRequest = 0x0030,
    SelectionAck = 0x0031,

    // Resources
    ResourceAdvertise = 0x0040,
    ResourceRequest = 0x0041,
    ResourceResponse = 0x0042,

    // Statement replication
    StatementOffer = 0x0050,
    StatementRequest = 0x0051,
    StatementResponse = 0x0052,

    // Deferred messaging
    DeferredSend = 0x0060,
    DeferredResult = 0x0061,
    DeferredBulkOffer = 0x0062,
    DeferredBulkRequest = 0x0063,
    DeferredBulkResponse = 0x0064,

    // Signature requests
    SignatureRequestOffer = 0x0070,
    SignatureRequestResult = 0x0071,
}

impl MessageCode {
    /// Every known code.
    pub const ALL: [MessageCode; 22] = [
        MessageCode::Salutation,
        MessageCode::Splice,
        MessageCode::SubRootRequest,
        MessageCode::SubRootResponse,
        MessageCode::LockInit,
        MessageCode::LockRequest,
        MessageCode::LockResponse,
        MessageCode::SelectionRequest,
        MessageCode::SelectionAck,
        MessageCode::ResourceAdvertise,
        MessageCode::ResourceRequest,
        MessageCode::ResourceResponse,
        MessageCode::StatementOffer,
        MessageCode::StatementRequest,
        MessageCode::StatementResponse,
        MessageCode::DeferredSend,
        MessageCode::DeferredResult,
        MessageCode::DeferredBulkOffer,
        MessageCode::DeferredBulkRequest,
        MessageCode::DeferredBulkResponse,
        MessageCode::SignatureRequestOffer,
        MessageCode::SignatureRequestResult,
    ];

    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.to_u16() == code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_lookup() {
        for code in MessageCode::ALL {
            assert_eq!(MessageCode::from_u16(code.to_u16()), Some(code));
        }
        assert_eq!(MessageCode::from_u16(0xffff), None);
    }
}
