//! Abort propagation: a worker Fail takes the whole job down.

use runtime::{Config, Role, RunError};
use transport::Grid;

#[test]
fn fail_propagates_the_exit_code() {
    let cfg = Config::default().with_types(&[1]);
    let mut handles = Vec::new();
    for comm in Grid::new(2) {
        let cfg = cfg.clone();
        handles.push(std::thread::spawn(move || {
            match runtime::init(cfg, comm).unwrap() {
                Role::Server(server) => match server.run() {
                    Err(RunError::Aborted(code)) => code,
                    other => panic!("expected an abort, got {other:?}"),
                },
                Role::Worker(worker) => {
                    worker.fail(17).unwrap();
                    0
                }
            }
        }));
    }
    let codes: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(codes.contains(&17));
}
