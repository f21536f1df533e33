// Test modules for Natgate
// Synthetic discoverers and gateways live in `mock`

mod port_tests;
mod upnp_tests;
