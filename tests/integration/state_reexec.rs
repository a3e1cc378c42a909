//! Serialising the daemon's world across an exec boundary: the document
//! travels through a real pipe as JSON, and the successor recomputes
//! blocker counts and pending-spawn state rather than trusting them.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::IntoRawFd;
use std::rc::Rc;

use emberd::event::{Blocked, EventPool, JobKey};
use emberd::expr;
use emberd::job::{Goal, Job, JobState, ProcessData};
use emberd::job_class::{
    ClassRegistry, JobClass, LimitValue, RlimitResource, RlimitSpec,
};
use emberd::operator::EventExpression;
use emberd::process::{ProcessRole, ProcessSpec};
use emberd::state;
use nix::unistd::pipe;

struct World {
    sessions: HashMap<String, Option<String>>,
    pool: EventPool,
    registry: ClassRegistry,
    conditions: BTreeMap<String, EventExpression>,
    jobs: BTreeMap<JobKey, Job>,
}

fn build_world() -> World {
    let mut pool = EventPool::new();
    let mut registry = ClassRegistry::new();
    let mut conditions = BTreeMap::new();
    let mut jobs = BTreeMap::new();

    let mut class = JobClass::new("worker");
    class.instance = "$ID".to_string();
    class.start_on = Some(expr::parse_str("startup or resume", 1).unwrap());
    class.stop_on = Some(expr::parse_str("shutdown", 1).unwrap());
    class.limits.insert(
        RlimitResource::Core,
        RlimitSpec {
            soft: LimitValue::Fixed(0),
            hard: LimitValue::Unlimited,
        },
    );
    class
        .processes
        .insert(ProcessRole::Main, ProcessSpec::new(false, "/usr/bin/worker"));
    let class = Rc::new(class);

    // The start condition latched a retained event.
    let trigger = pool.emit("startup", vec!["ID=a".to_string()]);
    pool.next_pending();
    let mut live = class.start_on.as_ref().unwrap().copy(&mut pool);
    live.handle(&mut pool, trigger, &[]);
    conditions.insert("worker".to_string(), live);

    // Three running tasks and one mid-spawn daemon with a latched death.
    for (name, pid) in [("a", 101), ("b", 102), ("c", 103)] {
        let mut job = Job::new(
            Rc::clone(&class),
            name.to_string(),
            vec![format!("ID={name}")],
            &mut pool,
        );
        job.goal = Goal::Start;
        job.state = JobState::Running;
        job.pids.insert(ProcessRole::Main, pid);
        jobs.insert(job.key(), job);
    }

    let mut spawning = Job::new(
        Rc::clone(&class),
        "d".to_string(),
        vec!["ID=d".to_string()],
        &mut pool,
    );
    spawning.goal = Goal::Start;
    spawning.state = JobState::Spawning;
    spawning.pids.insert(ProcessRole::Main, 104);
    spawning.pending.insert(
        ProcessRole::Main,
        ProcessData {
            pid: 104,
            valid: true,
            error_fd: 40,
            shell_fd: None,
            script: None,
            // The child died during the exec window; the status is
            // latched until setup resolves.
            status: Some(0),
        },
    );
    // It also holds its trigger.
    pool.block(trigger);
    spawning.blocking.push(Blocked::Event(trigger));
    jobs.insert(spawning.key(), spawning);

    registry.install(class, false);

    World {
        sessions: HashMap::new(),
        pool,
        registry,
        conditions,
        jobs,
    }
}

#[test]
fn the_world_survives_the_state_pipe() {
    let world = build_world();
    let doc = state::build(
        &world.sessions,
        &world.pool,
        &world.registry,
        &world.conditions,
        &world.jobs,
    )
    .expect("document builds");

    let (read_end, write_end) = pipe().expect("pipe");
    state::write_state(write_end.into_raw_fd(), &doc).expect("write");
    let received = state::read_state(read_end.into_raw_fd()).expect("read");
    assert_eq!(doc, received);

    let restored = state::restore(received).expect("restore");

    // Same instances, same states, same pids.
    assert_eq!(restored.jobs.len(), 4);
    for (name, pid) in [("a", 101), ("b", 102), ("c", 103)] {
        let job = restored
            .jobs
            .get(&JobKey::new("worker", name))
            .expect("instance");
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.goal, Goal::Start);
        assert_eq!(job.pids.get(&ProcessRole::Main), Some(&pid));
    }

    // The mid-spawn instance kept its latched status for the reaper.
    let spawning = restored
        .jobs
        .get(&JobKey::new("worker", "d"))
        .expect("spawning instance");
    assert_eq!(spawning.state, JobState::Spawning);
    let pending = spawning.pending.get(&ProcessRole::Main).expect("pending");
    assert_eq!(pending.status, Some(0));
    assert_eq!(pending.error_fd, 40);

    // Blockers were recomputed: one from the live condition's latched
    // leaf, one from the spawning job's waiter record.
    let (_, event) = restored
        .pool
        .iter()
        .find(|(_, e)| e.name == "startup")
        .expect("event retained");
    assert_eq!(event.blockers, 2);

    // The live condition still reports satisfied.
    let condition = restored
        .start_conditions
        .get("worker")
        .expect("live condition survived");
    assert!(condition.value());
}

#[test]
fn unlimited_limits_round_trip_as_infinity() {
    let world = build_world();
    let doc = state::build(
        &world.sessions,
        &world.pool,
        &world.registry,
        &world.conditions,
        &world.jobs,
    )
    .unwrap();

    let json = serde_json::to_string(&doc).unwrap();
    let parsed: state::StateDocument = serde_json::from_str(&json).unwrap();
    let restored = state::restore(parsed).unwrap();

    let class = &restored.classes[0];
    let spec = class.limits.get(&RlimitResource::Core).unwrap();
    assert_eq!(spec.soft.to_rlim(), 0);
    assert_eq!(spec.hard.to_rlim(), libc::RLIM_INFINITY);
}

#[test]
fn operator_trees_rebuild_from_their_post_order_arrays() {
    // An asymmetric tree is the discriminating case for the
    // reconstruction stack: children must pop right-first.
    let expr = expr::parse_str(
        "(a and b) or (c and (d or e f G=h))",
        1,
    )
    .unwrap();
    let serial = expr.serialise();
    let rebuilt = EventExpression::deserialise(&serial).expect("rebuild");
    assert_eq!(rebuilt.collapse(), expr.collapse());
    assert_eq!(rebuilt.serialise(), serial);
}
