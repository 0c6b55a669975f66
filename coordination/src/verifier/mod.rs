//! Verifier: static checks run on generated artifacts before they reach disk.

pub mod safety_scan;

pub use safety_scan::{
    FindingKind, PythonScanner, SafetyFinding, SafetyPolicy, ScanReport, SourceScanner,
    StaticPreCheck,
};
