//! End-to-end checks of the expression engine: parse, match, block,
//! reset, and collapse against a live event pool.

use emberd::event::EventPool;
use emberd::expr;

#[test]
fn mount_event_with_glob_arguments() {
    // Operator `mount DEVICE=/dev/sd?1 TYPE=ext4` against
    // `mount DEVICE=/dev/sdb1 TYPE=ext4 OPTIONS=ro`.
    let mut pool = EventPool::new();
    let mut condition = expr::parse_str("mount DEVICE=/dev/sd?1 TYPE=ext4", 1).unwrap();

    let id = pool.emit(
        "mount",
        vec![
            "DEVICE=/dev/sdb1".to_string(),
            "TYPE=ext4".to_string(),
            "OPTIONS=ro".to_string(),
        ],
    );
    pool.next_pending();

    assert!(condition.handle(&mut pool, id, &[]), "leaf latched");
    assert!(condition.value(), "operator value true");
    assert_eq!(pool.get(id).unwrap().blockers, 1, "event blocked once");

    condition.reset(&mut pool);
    assert_eq!(pool.get(id).unwrap().blockers, 0, "reset returns the block");
    assert!(!condition.value());
}

#[test]
fn handle_then_reset_leaves_blockers_unchanged() {
    let mut pool = EventPool::new();
    let mut condition = expr::parse_str("alpha and beta", 1).unwrap();

    let id = pool.emit("alpha", vec![]);
    pool.next_pending();
    pool.block(id);
    let before = pool.get(id).unwrap().blockers;

    condition.handle(&mut pool, id, &[]);
    condition.reset(&mut pool);

    assert_eq!(pool.get(id).unwrap().blockers, before);
}

#[test]
fn copy_matches_reset_law() {
    let mut pool = EventPool::new();
    let mut condition = expr::parse_str("alpha or beta", 1).unwrap();

    let id = pool.emit("beta", vec![]);
    pool.next_pending();
    condition.handle(&mut pool, id, &[]);

    let mut copied = condition.copy(&mut pool);
    assert_eq!(pool.get(id).unwrap().blockers, 2);
    assert_eq!(copied.collapse(), condition.collapse());
    assert_eq!(copied.value(), condition.value());

    // reset(copy(op)) and reset(op) drain to the same count.
    copied.reset(&mut pool);
    condition.reset(&mut pool);
    assert_eq!(pool.get(id).unwrap().blockers, 0);
}

#[test]
fn partially_matched_and_holds_its_side() {
    let mut pool = EventPool::new();
    let mut condition =
        expr::parse_str("local-filesystems and net-device-up IFACE!=lo", 1).unwrap();

    let fs_event = pool.emit("local-filesystems", vec![]);
    pool.next_pending();
    assert!(condition.handle(&mut pool, fs_event, &[]));
    assert!(!condition.value(), "and waits for the other side");
    assert_eq!(pool.get(fs_event).unwrap().blockers, 1);

    let net_event = pool.emit("net-device-up", vec!["IFACE=eth0".to_string()]);
    pool.next_pending();
    assert!(condition.handle(&mut pool, net_event, &[]));
    assert!(condition.value());

    // Both contributing events are collected, left to right, and named.
    let mut env = Vec::new();
    condition.environment(&pool, &mut env, Some("EVENTS"));
    assert!(env.contains(&"IFACE=eth0".to_string()));
    assert!(env.contains(&"EVENTS=local-filesystems net-device-up".to_string()));
}

#[test]
fn parse_collapse_round_trip_is_stable() {
    for source in [
        "startup",
        "runlevel [2345]",
        "startup or runlevel S",
        "(local-filesystems and net-device-up) or failsafe-boot",
        "a and b and c or d",
        "mount TYPE!=nfs DEVICE=/dev/sd*",
    ] {
        let collapsed = expr::parse_str(source, 1).unwrap().collapse();
        let again = expr::parse_str(&collapsed, 1).unwrap().collapse();
        assert_eq!(collapsed, again, "collapse of {source:?} is a fixed point");
    }
}

#[test]
fn unset_expansion_variable_fails_the_match() {
    let mut pool = EventPool::new();
    let mut condition = expr::parse_str("mount DEVICE=$UNSET", 1).unwrap();

    let id = pool.emit("mount", vec!["DEVICE=/dev/sda1".to_string()]);
    pool.next_pending();
    assert!(!condition.handle(&mut pool, id, &[]));
    assert!(!condition.value());
    assert_eq!(pool.get(id).unwrap().blockers, 0);
}
