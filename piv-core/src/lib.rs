//! PIV smart-card protocol core: APDU transport and chaining, the PIV
//! application state machine, and the ECDH sealed-envelope box.
//!
//! The four external collaborators this crate never implements itself —
//! the PC/SC resource manager, primitive crypto, X.509 parsing, and SSH
//! public-key blob codec — are reached only through the traits in
//! [`transport`], [`crypto_provider`], [`x509`], and [`sshkey`]. Everything
//! else (reader enumeration, CLI, persistence, OS integration) is out of
//! scope; see each module's doc comment for what it owns.

pub mod apdu;
pub mod config;
pub mod crypto_provider;
pub mod enumerate;
pub mod envelope;
pub mod error;
pub mod piv;
pub mod sshkey;
pub mod testing;
pub mod tlv;
pub mod transaction;
pub mod transport;
pub mod x509;

pub use config::PivConfig;
pub use enumerate::{enumerate, get_slot, release};
pub use envelope::{find_token, open, open_offline, seal, seal_offline, ECDHBox};
pub use error::{PivError, Result};
pub use piv::{Algorithm, Slot, SlotId, Token};
pub use transaction::TokenTransaction;
