use crate::port::{MIN_RANDOM_PORT, PortSelector};

#[test]
fn test_random_port_range() {
    let ports = PortSelector::from_entropy();
    for _ in 0..10_000 {
        let port = ports.random_port();
        assert!(port >= MIN_RANDOM_PORT, "port {} below range", port);
        assert!(port < u16::MAX, "port {} above range", port);
    }
}

#[test]
fn test_seeded_selectors_agree() {
    let a = PortSelector::seeded(42);
    let b = PortSelector::seeded(42);

    let first: Vec<u16> = (0..16).map(|_| a.random_port()).collect();
    let second: Vec<u16> = (0..16).map(|_| b.random_port()).collect();
    assert_eq!(first, second);
}

#[test]
fn test_different_seeds_differ() {
    let a = PortSelector::seeded(1);
    let b = PortSelector::seeded(2);

    let first: Vec<u16> = (0..16).map(|_| a.random_port()).collect();
    let second: Vec<u16> = (0..16).map(|_| b.random_port()).collect();
    assert_ne!(first, second);
}
