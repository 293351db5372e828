// wallwatch - BTC order-book wall monitor
// Layered: core (types/config/logging), layer1 (transport), layer2 (book state),
// layer3 (detectors/aggregators), alerts (routing + sink), store (persistence)

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
pub mod alerts;
pub mod store;
