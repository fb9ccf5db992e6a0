//! Provisioning sketch
//!
//! The firmware image that establishes a board's cloud identity. The source
//! is fixed; each configuration attempt pairs it with the target board's
//! fqbn and ships it base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// The provisioning dialog always runs at this baudrate.
pub const PROVISIONING_BAUDRATE: u32 = 9600;

const SKETCH_NAME: &str = "provisioning";
const PROVISIONING_SOURCE: &str = include_str!("provisioning.ino");

/// A compiled-and-encoded provisioning sketch, ready for upload.
#[derive(Debug, Clone)]
pub struct ProvisioningSketch {
    pub fqbn: String,
    pub name: &'static str,
    pub source: &'static str,
    /// Base64 of `source`, the shape the upload request carries.
    pub encoded: String,
}

/// Build the provisioning sketch for one target board.
pub fn provisioning_sketch(fqbn: &str) -> ProvisioningSketch {
    ProvisioningSketch {
        fqbn: fqbn.to_string(),
        name: SKETCH_NAME,
        source: PROVISIONING_SOURCE,
        encoded: STANDARD.encode(PROVISIONING_SOURCE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sketch_is_encoded_per_board() {
        let sketch = provisioning_sketch("boardlink:samd:mkr1000");
        assert_eq!(sketch.fqbn, "boardlink:samd:mkr1000");
        assert_eq!(sketch.name, "provisioning");

        let decoded = STANDARD.decode(&sketch.encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), sketch.source);
    }

    #[test]
    fn sketch_drives_the_expected_dialog() {
        let sketch = provisioning_sketch("boardlink:samd:mkr1000");
        assert!(sketch
            .source
            .contains("Would you like to generate a new private key and CSR (y/N):"));
        assert!(sketch.source.contains("No ECCX08 present"));
    }
}
