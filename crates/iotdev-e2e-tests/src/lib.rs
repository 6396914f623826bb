//! Cross-crate integration tests for the device runtime and the tunneling
//! emulator. All tests live under `tests/`.
