//! PIV application state machine (`spec.md` §4.D): selection, CHUID and
//! certificate reads, key generation, PIN/admin authentication, and
//! sign/ECDH operations.

pub mod admin;
pub mod algorithm;
pub mod sign;
pub mod slot;
pub mod token;

pub use admin::{auth_admin, change_admin_key, change_pin, verify_pin};
pub use algorithm::Algorithm;
pub use sign::{ecdh, sign, sign_prehash};
pub use slot::{Slot, SlotId};
pub use token::{generate, probe_yubico, read_all_certs, read_cert, read_chuid, select, write_cert, write_file, Token, PIV_AID};
