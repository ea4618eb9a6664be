//! Quality-of-service levels shared by the publish/subscribe packet types.

/// The three MQTT quality-of-service levels, plus a sentinel for a
/// malformed wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
    /// Not a real QoS level; produced by `From<u8>` when the two low bits
    /// of a flags byte don't map to 0/1/2 so callers can reject it explicitly.
    Invalid = 3,
}

impl From<u8> for QoS {
    fn from(value: u8) -> Self {
        match value {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::Invalid,
        }
    }
}

impl From<QoS> for u8 {
    fn from(value: QoS) -> Self {
        value as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for q in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            let byte: u8 = q.into();
            assert_eq!(QoS::from(byte), q);
        }
    }

    #[test]
    fn invalid_on_out_of_range() {
        assert_eq!(QoS::from(3), QoS::Invalid);
        assert_eq!(QoS::from(0xff), QoS::Invalid);
    }

    #[test]
    fn default_is_at_most_once() {
        assert_eq!(QoS::default(), QoS::AtMostOnce);
    }
}
