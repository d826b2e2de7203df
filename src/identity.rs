//! Camera identity: the stable hardware address plus the stream credentials.

use std::fmt;
use std::str::FromStr;

use crate::error::FeedError;

/// Six-octet hardware (MAC) address.
///
/// Parsing accepts colon- or hyphen-separated octets (or twelve bare hex
/// digits) in any letter case, so two spellings of the same address compare
/// equal once parsed. `Display` renders the canonical lowercase colon form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Lowercase colon form, e.g. `aa:bb:cc:dd:ee:ff`.
    pub fn canonical(&self) -> String {
        self.joined(':')
    }

    /// Lowercase hyphen form, as printed by Windows `arp -a`.
    pub fn hyphenated(&self) -> String {
        self.joined('-')
    }

    fn joined(&self, sep: char) -> String {
        let mut out = String::with_capacity(17);
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(sep);
            }
            out.push_str(&format!("{:02x}", octet));
        }
        out
    }
}

impl FromStr for HardwareAddress {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let invalid = || FeedError::InvalidIdentity(format!("malformed hardware address '{s}'"));

        let parts: Vec<&str> = if trimmed.contains(':') || trimmed.contains('-') {
            trimmed.split([':', '-']).collect()
        } else if trimmed.len() == 12 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            (0..6).map(|i| &trimmed[i * 2..i * 2 + 2]).collect()
        } else {
            return Err(invalid());
        };
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Immutable identity of one camera. Credentials are kept raw; encoding
/// happens only when a stream URL is built.
#[derive(Clone, PartialEq, Eq)]
pub struct CameraIdentity {
    hardware_address: HardwareAddress,
    user: String,
    secret: String,
}

impl CameraIdentity {
    pub fn new(hardware_address: HardwareAddress, user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            hardware_address,
            user: user.into(),
            secret: secret.into(),
        }
    }

    /// Parse the hardware address and build an identity in one step.
    pub fn parse(hardware_address: &str, user: &str, secret: &str) -> crate::Result<Self> {
        Ok(Self::new(hardware_address.parse()?, user, secret))
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        self.hardware_address
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// User name escaped for the authority component of a URL.
    pub fn encoded_user(&self) -> String {
        urlencoding::encode(&self.user).into_owned()
    }

    /// Secret escaped for the authority component of a URL.
    pub fn encoded_secret(&self) -> String {
        urlencoding::encode(&self.secret).into_owned()
    }
}

// The secret never reaches logs through `{:?}`.
impl fmt::Debug for CameraIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraIdentity")
            .field("hardware_address", &self.hardware_address)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}
