//! Header names used by the payment gate.

/// Request header carrying a previously minted access token.
pub const PAYMENT_TOKEN_HEADER: &str = "payment-token";

/// Request header carrying the on-chain transaction id of a payment.
pub const PAYMENT_TXID_HEADER: &str = "payment-txid";

/// Request header naming the payment reference the transaction settles.
pub const PAYMENT_REFERENCE_HEADER: &str = "payment-reference";

/// Response header echoing a freshly minted access token.
pub const PAYMENT_TOKEN_RESPONSE_HEADER: &str = "payment-token";

/// Response header carrying the minted token's expiry (unix seconds).
pub const PAYMENT_TOKEN_EXPIRY_HEADER: &str = "payment-token-expiry";
