//! End-to-end scenarios: every rank of a small world runs on its own
//! thread over the in-process fabric.

use bytes::Bytes;
use protocol::value::Value;
use protocol::{CreateSpec, Error, NotifyEvent, RetrieveMode, SubscribeOutcome, Target};
use runtime::{Config, Role, Worker};
use std::sync::{Arc, Mutex};
use transport::{Grid, GridComm};

/// Run a world: the configured servers plus one thread per worker rank
/// executing `body`. Panics in any rank fail the test.
fn run_world<F>(cfg: Config, world: u32, body: F)
where
    F: Fn(u32, Worker<GridComm>) + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let mut handles = Vec::new();
    for comm in Grid::new(world) {
        let cfg = cfg.clone();
        let body = body.clone();
        handles.push(std::thread::spawn(move || {
            match runtime::init(cfg, comm).unwrap() {
                Role::Server(server) => server.run().unwrap(),
                Role::Worker(worker) => body(worker.rank(), worker),
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Subscribe, retrying while the datum has not been created yet.
fn subscribe_when_created(
    worker: &mut Worker<GridComm>,
    id: protocol::DatumId,
) -> SubscribeOutcome {
    loop {
        match worker.subscribe(id, None) {
            Ok(outcome) => return outcome,
            Err(Error::NotFound(_)) => std::thread::yield_now(),
            Err(err) => panic!("subscribe failed: {err}"),
        }
    }
}

#[test]
fn single_put_single_get() {
    let cfg = Config::default().with_types(&[1]);
    run_world(cfg, 3, |rank, mut worker| match rank {
        0 => {
            worker
                .put(1, 0, Target::any(), 1, 0, Bytes::from_static(b"hi"))
                .unwrap();
            worker.finalize().unwrap();
        }
        1 => {
            let task = worker.get(&[1]).unwrap().expect("one task to arrive");
            assert_eq!(task.work_type, 1);
            assert_eq!(task.payload.as_ref(), b"hi");
            assert!(task.parallel.is_none());
            // Quiescence: the next Get reports shutdown.
            assert!(worker.get(&[1]).unwrap().is_none());
            worker.finalize().unwrap();
        }
        _ => unreachable!(),
    });
}

#[test]
fn write_after_subscribe_notifies_through_the_task_path() {
    const ID: protocol::DatumId = 100;
    let cfg = Config::default().with_types(&[9]);
    run_world(cfg, 3, |rank, mut worker| match rank {
        // The writer: create, wait for the reader to be ready, store.
        0 => {
            let id = worker
                .create(CreateSpec {
                    hint: Some(ID),
                    ..CreateSpec::new(protocol::value::DataType::Integer)
                })
                .unwrap();
            assert_eq!(id, ID);
            // Reader signals readiness with a type-9 task.
            worker.get(&[9]).unwrap().expect("readiness signal");
            worker.store_value(ID, &Value::Integer(42), 1).unwrap();
            worker.finalize().unwrap();
        }
        // The reader: subscribe, signal, await the CONTROL notification.
        1 => {
            assert_eq!(subscribe_when_created(&mut worker, ID), SubscribeOutcome::Pending);
            worker
                .put(9, 0, Target::any(), 1, 1, Bytes::new())
                .unwrap();

            let task = worker
                .get(&[protocol::CONTROL])
                .unwrap()
                .expect("a notification");
            assert_eq!(task.work_type, protocol::CONTROL);
            let notification = Worker::<GridComm>::decode_notification(&task.payload).unwrap();
            assert_eq!(notification.id, ID);
            assert_eq!(notification.event, NotifyEvent::Ready);

            let value = worker.retrieve_value(ID, RetrieveMode::ReadRc).unwrap();
            assert_eq!(value, Value::Integer(42));
            // The read refcount hit zero: the datum is gone.
            assert!(matches!(
                worker.retrieve(ID, RetrieveMode::NoRc),
                Err(Error::NotFound(_))
            ));
            worker.finalize().unwrap();
        }
        _ => unreachable!(),
    });
}

#[test]
fn parallel_task_of_width_three() {
    let seen: Arc<Mutex<Vec<(u32, u64, u32, Vec<u32>)>>> = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    let cfg = Config::default().with_types(&[1]);
    run_world(cfg, 4, move |rank, mut worker| {
        if rank == 0 {
            worker
                .put(1, 0, Target::any(), 3, 0, Bytes::from_static(b"abc"))
                .unwrap();
        }
        let task = worker.get(&[1]).unwrap().expect("cohort assignment");
        assert_eq!(task.payload.as_ref(), b"abc");
        let group = task.parallel.expect("parallel group");
        record
            .lock()
            .unwrap()
            .push((rank, group.group_id, group.member_index, group.ranks));
        assert!(worker.get(&[1]).unwrap().is_none());
        worker.finalize().unwrap();
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    let (_, group_id, _, ranks) = seen[0].clone();
    assert_eq!(ranks.len(), 3);
    for (rank, gid, index, member_ranks) in seen.iter() {
        // Same group, consistent membership, and each member's index
        // names itself.
        assert_eq!(*gid, group_id);
        assert_eq!(member_ranks, &ranks);
        assert_eq!(ranks[*index as usize], *rank);
    }
    let mut sorted = ranks.clone();
    sorted.sort();
    assert_eq!(sorted, vec![0, 1, 2]);
}

#[test]
fn cross_server_notification_routes_through_the_home_server() {
    const ID: protocol::DatumId = 100; // owned by server index 0
    let cfg = Config {
        servers: 2,
        ..Config::default()
    }
    .with_types(&[9]);
    run_world(cfg, 4, |rank, mut worker| match rank {
        0 => {
            let id = worker
                .create(CreateSpec {
                    hint: Some(ID),
                    ..CreateSpec::new(protocol::value::DataType::Integer)
                })
                .unwrap();
            assert_eq!(id, ID);
            worker.get(&[9]).unwrap().expect("readiness signal");
            worker.store_value(ID, &Value::Integer(7), 1).unwrap();
            worker.finalize().unwrap();
        }
        1 => {
            assert_eq!(subscribe_when_created(&mut worker, ID), SubscribeOutcome::Pending);
            // Hard-target the signal at worker 0 so it parks on 0's own
            // home server.
            worker
                .put(9, 0, Target::rank(0), 1, 1, Bytes::new())
                .unwrap();

            let task = worker
                .get(&[protocol::CONTROL])
                .unwrap()
                .expect("a notification");
            let notification = Worker::<GridComm>::decode_notification(&task.payload).unwrap();
            assert_eq!(notification.id, ID);
            assert_eq!(notification.event, NotifyEvent::Ready);
            assert_eq!(
                worker.retrieve_value(ID, RetrieveMode::ReadRc).unwrap(),
                Value::Integer(7)
            );
            worker.finalize().unwrap();
        }
        _ => unreachable!(),
    });
}

#[test]
fn repeated_retrieves_stay_coherent_under_cache_pressure() {
    let cfg = Config {
        cache_entries: 4,
        ..Config::default()
    }
    .with_types(&[1]);
    run_world(cfg, 2, |_rank, mut worker| {
        let ids: Vec<_> = (0..8)
            .map(|i| {
                let id = worker
                    .create(CreateSpec::new(protocol::value::DataType::String))
                    .unwrap();
                worker
                    .store_value(id, &Value::String(format!("value-{i}")), 1)
                    .unwrap();
                (i, id)
            })
            .collect();

        // First sweep populates and overflows the 4-entry cache; the
        // second must read back identical bytes regardless of hit or
        // miss.
        for _ in 0..2 {
            for (i, id) in &ids {
                let value = worker.retrieve_value(*id, RetrieveMode::NoRc).unwrap();
                assert_eq!(value, Value::String(format!("value-{i}")));
            }
        }
        worker.finalize().unwrap();
    });
}

#[test]
fn empty_accept_set_is_rejected() {
    let cfg = Config::default().with_types(&[1]);
    run_world(cfg, 2, |_rank, mut worker| {
        assert!(matches!(worker.get(&[]), Err(Error::Invalid(_))));
        worker.finalize().unwrap();
    });
}

#[test]
fn try_get_probes_without_blocking() {
    let cfg = Config::default().with_types(&[1]);
    run_world(cfg, 2, |_rank, mut worker| {
        assert!(worker.try_get(&[1]).unwrap().is_none());
        worker
            .put(1, 0, Target::any(), 1, 0, Bytes::from_static(b"x"))
            .unwrap();
        let task = worker.try_get(&[1]).unwrap().expect("queued task");
        assert_eq!(task.payload.as_ref(), b"x");
        worker.finalize().unwrap();
    });
}

#[test]
fn oversize_payload_and_unknown_type_are_rejected() {
    let cfg = Config {
        max_payload: 64,
        ..Config::default()
    }
    .with_types(&[1]);
    run_world(cfg, 2, |_rank, mut worker| {
        assert!(matches!(
            worker.put(1, 0, Target::any(), 1, 0, Bytes::from(vec![0u8; 65])),
            Err(Error::PayloadTooLarge { got: 65, max: 64 })
        ));
        assert!(matches!(
            worker.put(5, 0, Target::any(), 1, 0, Bytes::new()),
            Err(Error::Invalid(_))
        ));
        // Parallelism beyond the worker count can never be satisfied.
        assert!(matches!(
            worker.put(1, 0, Target::any(), 2, 0, Bytes::new()),
            Err(Error::Invalid(_))
        ));
        worker.finalize().unwrap();
    });
}

#[test]
fn unique_ids_and_multi_create_stay_disjoint() {
    let cfg = Config::default().with_types(&[1]);
    run_world(cfg, 2, |_rank, mut worker| {
        let a = worker.unique_id().unwrap();
        let ids = worker
            .multi_create(vec![
                CreateSpec::new(protocol::value::DataType::Integer),
                CreateSpec::new(protocol::value::DataType::Blob),
            ])
            .unwrap();
        let b = worker.unique_id().unwrap();

        let mut all = vec![a, b];
        all.extend(&ids);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4, "ids must never repeat");
        worker.finalize().unwrap();
    });
}

#[test]
fn container_insert_and_lookup() {
    let cfg = Config::default().with_types(&[1]);
    run_world(cfg, 2, |_rank, mut worker| {
        let container = worker
            .create(CreateSpec {
                write_rc: 2,
                ..CreateSpec::new(protocol::value::DataType::Container)
            })
            .unwrap();
        let member = worker
            .create(CreateSpec::new(protocol::value::DataType::Integer))
            .unwrap();
        worker.store_value(member, &Value::Integer(5), 1).unwrap();

        worker
            .insert(container, Bytes::from_static(b"k"), member, 1)
            .unwrap();
        assert_eq!(
            worker.lookup(container, Bytes::from_static(b"k")).unwrap(),
            member
        );
        assert!(worker.exists(container, Some(Bytes::from_static(b"k"))).unwrap());
        assert!(!worker.exists(container, Some(Bytes::from_static(b"zz"))).unwrap());
        worker.finalize().unwrap();
    });
}
