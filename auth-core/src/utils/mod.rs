pub mod clock;
pub mod fingerprint;
pub mod password;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{DeviceFingerprinter, DeviceInfo};
pub use password::{CredentialVerifier, Password, PasswordHashString};
pub use validation::PasswordLoginInput;
