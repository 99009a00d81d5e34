use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Input,
    Output,
}

impl Side {
    fn tag(self) -> u8 {
        match self {
            Side::Input => 0,
            Side::Output => 1,
        }
    }
}

/// Content-addressed cache key: blake3 over `(side, text)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn compute(side: Side, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[side.tag()]);
        hasher.update(text.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Hex form used as the remote-tier key suffix.
    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sides_never_collide() {
        let input = Fingerprint::compute(Side::Input, "same text");
        let output = Fingerprint::compute(Side::Output, "same text");
        assert_ne!(input, output);
    }

    #[test]
    fn deterministic_and_hexable() {
        let a = Fingerprint::compute(Side::Input, "hello");
        let b = Fingerprint::compute(Side::Input, "hello");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }
}
