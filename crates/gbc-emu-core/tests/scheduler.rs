use gbc_emu_core::scheduler::{Scheduler, TaskId, TaskKind};
use rand::{Rng, SeedableRng, rngs::StdRng};

#[test]
fn fires_in_target_order_against_a_model() {
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..20 {
        let mut sched = Scheduler::new();
        let ids: Vec<TaskId> = (0..32)
            .map(|i| sched.register(TaskKind::TimerOverflow, i))
            .collect();
        let mut model: Vec<Option<u64>> = vec![None; ids.len()];

        for _ in 0..300 {
            let i = rng.gen_range(0..ids.len());
            if rng.gen_bool(0.7) {
                let target = sched.now() + rng.gen_range(0..16);
                sched.schedule(ids[i], target);
                model[i] = Some(target);
            } else {
                sched.cancel(ids[i]);
                model[i] = None;
            }
            for (slot, (id, _)) in sched.pending().enumerate() {
                assert_eq!(sched.heap_index(id), slot as i32);
            }
            assert_eq!(sched.len(), model.iter().flatten().count());
        }

        let mut expected: Vec<u64> = model.iter().flatten().copied().collect();
        expected.sort_unstable();
        assert_eq!(
            sched.next_target(),
            expected.first().copied(),
            "round {round}"
        );

        let mut fired = Vec::new();
        sched.advance(1_000, |s, id| {
            assert_eq!(s.heap_index(id), -1);
            fired.push(s.now());
        });
        assert_eq!(fired, expected, "round {round}");
        assert!(sched.is_empty());
        assert_eq!(sched.now(), 1_000);
    }
}

#[test]
fn firing_task_can_cancel_another() {
    let mut sched = Scheduler::new();
    let a = sched.register(TaskKind::TimerOverflow, 0);
    let b = sched.register(TaskKind::TimerReload, 0);
    sched.schedule(a, 5);
    sched.schedule(b, 5);
    let mut fired = Vec::new();
    sched.advance(10, |s, id| {
        fired.push(id);
        let other = if id == a { b } else { a };
        s.cancel(other);
    });
    assert_eq!(fired.len(), 1, "same-target sibling was cancelled first");
}

#[test]
fn clock_reads_task_target_while_firing() {
    let mut sched = Scheduler::new();
    let tick = sched.register(TaskKind::AudioFrameTick, 0);
    sched.schedule_in(tick, 7);
    let mut seen = Vec::new();
    sched.advance(30, |s, id| {
        seen.push(s.now());
        s.schedule_in(id, 7);
    });
    assert_eq!(seen, vec![7, 14, 21, 28]);
    assert_eq!(sched.target(tick), Some(35));
}

#[test]
fn tasks_are_found_by_kind_and_argument() {
    let mut sched = Scheduler::new();
    let a = sched.register(TaskKind::AudioSampleTick, 3);
    let b = sched.register(TaskKind::AudioSampleTick, 4);
    assert_eq!(sched.find(TaskKind::AudioSampleTick, 3), Some(a));
    assert_eq!(sched.find(TaskKind::AudioSampleTick, 4), Some(b));
    assert_eq!(sched.find(TaskKind::TimerReload, 3), None);
    assert_eq!(sched.kind(b), TaskKind::AudioSampleTick);
    assert_eq!(sched.arg(b), 4);
}
