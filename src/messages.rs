/// Lightweight tag queued from edge-interrupt context. Carries no hardware handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ButtonTag {
    OutdoorCover,
    IndoorCover,
    Lock,
}

impl ButtonTag {
    pub fn name(&self) -> &'static str {
        match self {
            ButtonTag::OutdoorCover => "outdoor cover",
            ButtonTag::IndoorCover => "indoor cover",
            ButtonTag::Lock => "lock",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    Public,
    Random,
    Unknown,
}

/// One advertisement observed during a scan cycle.
#[derive(Clone, Debug)]
pub struct ScanResult {
    pub address: [u8; 6],
    pub address_kind: AddressKind,
    /// dBm
    pub rssi: i16,
    /// Raw (length, type, value) records
    pub payload: Vec<u8>,
}

impl ScanResult {
    pub fn address_string(&self) -> String {
        self.address
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}
