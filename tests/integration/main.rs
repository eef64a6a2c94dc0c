//! Integration test driver for `tests/integration/`.
//!
//! Each scenario module runs a real engine against [`mock_radio::MockRadio`],
//! so no Bluetooth adapter is needed.

mod characteristic_tests;
mod connection_tests;
mod mock_radio;
mod record_access_tests;
mod support;
