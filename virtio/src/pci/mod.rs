//! PCI enumeration and configuration access.
//!
//! # Reference
//! - PCI Local Bus Spec 3.0
//! - VirtIO Spec 1.2 §4.1.2 (PCI device discovery)

pub mod config;

pub use config::{
    offset, pci_cfg_read16, pci_cfg_read32, pci_cfg_read8, pci_cfg_write16, pci_cfg_write32,
    PciAddr,
};
