use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, unbounded};

use crate::{
    backend::{ManualBackend, NotificationEvent},
    clock::ClockSource,
    config::RegistryConfig,
    dispatch_loop::Stop,
    errors::{ParseError, SpecField, TimerError},
    interval::{Interval, parse},
    timer_table::{TimerHandle, TimerPayload, TimerRegistry, TimerState},
};

type Fired = (TimerHandle, usize, u64, u64);

fn registry_with(
    config: RegistryConfig,
    capacity: usize,
) -> (TimerRegistry<usize>, Arc<ManualBackend>, Receiver<Fired>) {
    let (sender, receiver) = unbounded::<Fired>();
    let backend = Arc::new(ManualBackend::new(capacity));
    let registry = TimerRegistry::<usize>::new(config)
        .on_expiration(move |record, event| {
            assert_eq!(event.payload(), record.handle());
            sender
                .send((
                    record.handle(),
                    *record.payload(),
                    record.overrun_count(),
                    record.creation_order(),
                ))
                .unwrap();
        })
        .backend(backend.clone())
        .build()
        .unwrap();
    (registry, backend, receiver)
}

fn registry() -> (TimerRegistry<usize>, Arc<ManualBackend>, Receiver<Fired>) {
    registry_with(RegistryConfig::default(), 16)
}

fn deliver_pending<P: TimerPayload>(registry: &TimerRegistry<P>, backend: &ManualBackend) {
    use crate::backend::{TimerBackend, Wakeup};
    if let Ok(Wakeup::Notifications(events)) = backend.wait() {
        for event in &events {
            registry.on_notification(event);
        }
    }
}

#[test]
fn test_build_requires_callback() {
    let built = TimerRegistry::<usize>::new(RegistryConfig::default())
        .backend(Arc::new(ManualBackend::new(1)))
        .build();
    assert!(matches!(built, Err(TimerError::BuildErrorNoCallbackSet)));
}

#[test_log::test]
fn test_arm_then_cancel_leaves_nothing() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(parse("2").unwrap(), 7).unwrap();
    assert_eq!(registry.len(), 1);
    assert_eq!(backend.live_timers(), 1);

    registry.cancel(handle).unwrap();
    assert!(registry.is_empty());
    assert_eq!(backend.live_timers(), 0);
    assert!(!backend.fire(handle, 0));

    // a notification racing the cancel is dropped
    registry.on_notification(&NotificationEvent::new(libc::SIGUSR1, handle));
    assert!(fired.try_recv().is_err());
}

#[test]
fn test_one_shot_notifies_once() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(Interval::one_shot(Duration::from_secs(2)), 3).unwrap();

    assert!(backend.fire(handle, 0));
    deliver_pending(&registry, &backend);
    assert_eq!(fired.try_recv().unwrap(), (handle, 3, 0, 0));

    assert!(!backend.fire(handle, 0));
    registry.on_notification(&NotificationEvent::new(libc::SIGUSR1, handle));
    assert!(fired.try_recv().is_err());

    let record = registry.get(handle).unwrap();
    assert_eq!(record.state(), TimerState::Expired);
    assert_eq!(record.notifications(), 1);
    assert_eq!(record.overrun_count(), 0);
    assert_eq!(registry.armed_count(), 0);
}

#[test]
fn test_periodic_overrun_accumulates() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(parse("5:2").unwrap(), 0).unwrap();

    backend.fire(handle, 0);
    deliver_pending(&registry, &backend);
    backend.fire(handle, 3);
    deliver_pending(&registry, &backend);

    assert_eq!(fired.try_recv().unwrap().2, 0);
    assert_eq!(fired.try_recv().unwrap().2, 3);
    let record = registry.get(handle).unwrap();
    assert_eq!(record.state(), TimerState::Armed);
    assert_eq!(record.notifications(), 2);
    assert_eq!(record.overrun_count(), 3);
}

#[test]
fn test_unknown_notification_is_dropped() {
    let (registry, backend, fired) = registry();
    registry.arm(parse("1").unwrap(), 0).unwrap();
    backend.inject(NotificationEvent::new(libc::SIGUSR1, TimerHandle::from_raw(u64::MAX)));
    deliver_pending(&registry, &backend);
    assert!(fired.try_recv().is_err());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_batch_keeps_input_order() {
    let (registry, backend, fired) = registry();
    let handles = registry
        .arm_specs(&["3", "5:2", "5/5000000:2"], |index, _| index * 10)
        .unwrap();
    assert_eq!(handles.len(), 3);
    assert_eq!(registry.handles(), handles);

    for (order, handle) in handles.iter().enumerate() {
        let record = registry.get(*handle).unwrap();
        assert_eq!(record.creation_order(), order as u64);
        assert_eq!(*record.payload(), order * 10);
    }
    assert_eq!(
        registry.get(handles[2]).unwrap().interval(),
        Interval::periodic(Duration::new(5, 5_000_000), Duration::from_secs(2))
    );

    backend.fire(handles[1], 0);
    deliver_pending(&registry, &backend);
    assert_eq!(fired.try_recv().unwrap(), (handles[1], 10, 0, 1));
}

#[test]
fn test_batch_stops_at_malformed_spec() {
    let (registry, backend, _fired) = registry();
    let err = registry
        .arm_specs(&["4", "4/x", "6"], |index, _| index)
        .unwrap_err();
    assert!(matches!(
        err,
        TimerError::Parse {
            index: 1,
            source: ParseError::InvalidNumber(SpecField::InitialNanos)
        }
    ));

    let handles = registry.handles();
    assert_eq!(handles.len(), 1);
    let first = registry.get(handles[0]).unwrap();
    assert_eq!(first.creation_order(), 0);
    assert_eq!(first.state(), TimerState::Armed);
    assert_eq!(backend.live_timers(), 1);
    assert!(backend.is_armed(handles[0]));
}

#[test]
fn test_zero_initial_expiration() {
    let (registry, _backend, _fired) = registry();
    assert!(matches!(
        registry.arm(parse("0:1").unwrap(), 0),
        Err(TimerError::InvalidInterval)
    ));
    assert!(registry.is_empty());

    let (registry, backend, _fired) =
        registry_with(RegistryConfig::new().allow_immediate_expiration(true), 4);
    let handle = registry.arm(parse("0").unwrap(), 0).unwrap();
    assert!(backend.is_armed(handle));
    assert_eq!(
        backend.interval_of(handle).unwrap().initial(),
        Duration::from_nanos(1)
    );
}

#[test]
fn test_resource_exhausted() {
    let (registry, _backend, _fired) = registry_with(RegistryConfig::default(), 2);
    registry.arm(parse("1").unwrap(), 0).unwrap();
    registry.arm(parse("1").unwrap(), 1).unwrap();
    let err = registry.arm(parse("1").unwrap(), 2).unwrap_err();
    assert!(matches!(err, TimerError::ResourceExhausted(_)));
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_cancel_unknown_handle() {
    let (registry, _backend, _fired) = registry();
    let handle = registry.arm(parse("1").unwrap(), 0).unwrap();
    registry.cancel(handle).unwrap();
    assert!(matches!(
        registry.cancel(handle),
        Err(TimerError::UnknownHandle(h)) if h == handle
    ));
}

#[test]
fn test_handles_are_not_reused() {
    let (registry, _backend, _fired) = registry();
    let first = registry.arm(parse("1").unwrap(), 0).unwrap();
    registry.cancel(first).unwrap();
    let second = registry.arm(parse("1").unwrap(), 0).unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_handles_are_distinct_across_registries() {
    let (first, first_backend, first_fired) = registry();
    let (second, second_backend, second_fired) = registry();
    let a = first.arm(parse("1").unwrap(), 1).unwrap();
    let b = second.arm(parse("1").unwrap(), 2).unwrap();
    assert_ne!(a, b);
    assert!(!second.contains(a));
    assert!(!first_backend.fire(b, 0));

    second_backend.fire(b, 0);
    deliver_pending(&second, &second_backend);
    assert_eq!(second_fired.try_recv().unwrap().1, 2);
    assert!(first_fired.try_recv().is_err());
    assert_eq!(first.get(a).unwrap().state(), TimerState::Armed);
}

#[test]
fn test_callback_may_cancel_its_timer() {
    let backend = Arc::new(ManualBackend::new(4));
    let (sender, receiver) = unbounded::<TimerRegistry<()>>();
    let registry = TimerRegistry::<()>::new(RegistryConfig::default())
        .on_expiration(move |record, _| {
            if let Ok(registry) = receiver.try_recv() {
                registry.cancel(record.handle()).unwrap();
            }
        })
        .backend(backend.clone())
        .build()
        .unwrap();
    sender.send(registry.clone()).unwrap();

    let handle = registry.arm(parse("1:1").unwrap(), ()).unwrap();
    backend.fire(handle, 0);
    deliver_pending(&registry, &backend);
    assert!(!registry.contains(handle));
    assert_eq!(backend.live_timers(), 0);
}

#[test]
fn test_rearm_expired_timer() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(parse("1").unwrap(), 5).unwrap();
    backend.fire(handle, 0);
    deliver_pending(&registry, &backend);
    assert_eq!(registry.get(handle).unwrap().state(), TimerState::Expired);

    registry.rearm(handle, parse("2:1").unwrap()).unwrap();
    let record = registry.get(handle).unwrap();
    assert_eq!(record.state(), TimerState::Armed);
    assert_eq!(record.interval(), parse("2:1").unwrap());

    backend.fire(handle, 0);
    deliver_pending(&registry, &backend);
    assert_eq!(fired.len(), 2);
    assert!(matches!(
        registry.rearm(TimerHandle::from_raw(u64::MAX - 1), parse("1").unwrap()),
        Err(TimerError::UnknownHandle(_))
    ));
}

#[test]
fn test_arm_with_clock() {
    let (registry, backend, _fired) = registry();
    let handle = registry
        .arm_with_clock(ClockSource::Monotonic, parse("1").unwrap(), 0)
        .unwrap();
    assert_eq!(registry.get(handle).unwrap().clock(), ClockSource::Monotonic);
    assert_eq!(backend.clock_of(handle), Some(ClockSource::Monotonic));

    let handle = registry.arm(parse("1").unwrap(), 0).unwrap();
    assert_eq!(backend.clock_of(handle), Some(ClockSource::Realtime));
}

#[test]
fn test_shutdown_and_drop_release_timers() {
    let (registry, backend, _fired) = registry();
    registry.arm_specs(&["1", "2", "3"], |i, _| i).unwrap();
    registry.shutdown().unwrap();
    assert!(registry.is_empty());
    assert_eq!(backend.live_timers(), 0);

    registry.arm_specs(&["1", "2"], |i, _| i).unwrap();
    let clone = registry.clone();
    drop(registry);
    assert_eq!(backend.live_timers(), 2);
    drop(clone);
    assert_eq!(backend.live_timers(), 0);
}

#[test_log::test]
fn test_dispatcher_stops_on_termination() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(parse("1:1").unwrap(), 9).unwrap();
    backend.fire(handle, 0);
    backend.fire(handle, 1);
    backend.request_shutdown(libc::SIGTERM);

    let stop = registry.dispatcher().run().unwrap();
    assert_eq!(stop, Stop::Terminated(libc::SIGTERM));
    assert!(fired.is_empty());

    // expirations queued behind the request are kept for the next dispatch
    deliver_pending(&registry, &backend);
    deliver_pending(&registry, &backend);
    assert_eq!(fired.len(), 2);
    assert_eq!(registry.get(handle).unwrap().overrun_count(), 1);
}

#[test]
fn test_termination_wins_over_busy_timer() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(parse("1:1").unwrap(), 0).unwrap();
    for _ in 0..100 {
        backend.fire(handle, 0);
    }
    backend.request_shutdown(libc::SIGINT);
    assert_eq!(
        registry.dispatcher().run_until_idle().unwrap(),
        Stop::Terminated(libc::SIGINT)
    );
    assert!(fired.is_empty());
}

#[test]
fn test_termination_reported_when_idle() {
    let (registry, backend, _fired) = registry();
    backend.request_shutdown(libc::SIGTERM);
    assert_eq!(
        registry.dispatcher().run_until_idle().unwrap(),
        Stop::Terminated(libc::SIGTERM)
    );
    assert_eq!(registry.dispatcher().run_until_idle().unwrap(), Stop::Idle);
}

#[test]
fn test_spawned_dispatcher() {
    let (registry, backend, fired) = registry();
    let handles = registry.arm_specs(&["1:1", "2:1"], |i, _| i).unwrap();
    let dispatcher = registry.dispatcher().spawn();
    for handle in &handles {
        backend.fire(*handle, 0);
    }
    let mut payloads: Vec<usize> = (0..handles.len())
        .map(|_| fired.recv_timeout(Duration::from_secs(5)).unwrap().1)
        .collect();
    backend.request_shutdown(libc::SIGINT);

    assert_eq!(dispatcher.join().unwrap().unwrap(), Stop::Terminated(libc::SIGINT));
    payloads.sort_unstable();
    assert_eq!(payloads, vec![0, 1]);
}

#[test]
fn test_dispatcher_stops_when_idle() {
    let (registry, backend, fired) = registry();
    let handle = registry.arm(parse("1").unwrap(), 0).unwrap();
    backend.fire(handle, 0);
    assert_eq!(registry.dispatcher().run_until_idle().unwrap(), Stop::Idle);
    assert_eq!(fired.len(), 1);

    // nothing armed, returns without waiting
    assert_eq!(registry.dispatcher().run_until_idle().unwrap(), Stop::Idle);
}
