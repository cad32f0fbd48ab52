use std::sync::{Arc, Mutex};
use std::time::Duration;

use slang::port::QUEUE_CAPACITY;

use slang::definition::OperatorDef;
use slang::synchronizer::{SyncError, Token};
use slang::{Operator, OperatorFunction, Properties, Synchronizer, TypeDescriptor, Value};

const CALLERS: usize = 16;
// more requests in flight than the two queues between pusher and worker hold
const LOADED_CALLERS: usize = 3 * QUEUE_CAPACITY;

fn echo() -> OperatorFunction {
    Arc::new(|op: &Operator| {
        let input = op.main().in_port();
        let output = op.main().out_port();
        while !op.stopped() {
            output.push(input.pull()?)?;
        }
        Ok(())
    })
}

fn echo_network() -> Arc<Operator> {
    let def = OperatorDef::with_main(TypeDescriptor::Number, TypeDescriptor::Number);
    let root = Operator::new("server", None, &def, &Default::default(), Properties::new()).unwrap();
    let leaf = Operator::new("echo", Some(echo()), &def, &Default::default(), Properties::new()).unwrap();
    leaf.set_parent(&root).unwrap();
    root.main().in_port().connect(leaf.main().in_port()).unwrap();
    leaf.main().out_port().connect(root.main().out_port()).unwrap();
    root.main().out_port().bufferize();
    root
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replies_are_served_in_push_order() {
    let root = echo_network();
    root.start().unwrap();
    let sync = Synchronizer::new(root.main().out_port().clone(), root.main().in_port().clone());
    let worker = sync.spawn_worker().unwrap();

    let mut pushers = Vec::new();
    for i in 0..CALLERS {
        let sync = sync.clone();
        pushers.push(tokio::task::spawn_blocking(move || {
            let payload = i as f64;
            let token = sync.push(|out| out.push(Value::Number(payload))).unwrap();
            (token, payload)
        }));
    }
    let mut pushed = Vec::new();
    for pusher in pushers {
        pushed.push(pusher.await.unwrap());
    }
    pushed.sort_by_key(|(token, _)| *token);

    let served: Arc<Mutex<Vec<Token>>> = Arc::new(Mutex::new(Vec::new()));
    let mut pullers = Vec::new();
    for (token, payload) in pushed.iter().rev().copied() {
        let sync = sync.clone();
        let served = served.clone();
        pullers.push(tokio::task::spawn_blocking(move || {
            let reply = sync
                .pull(token, move |input| {
                    served.lock().unwrap().push(token);
                    input.pull_number()
                })
                .unwrap()
                .unwrap();
            assert_eq!(reply, payload, "{token} got another caller's reply");
        }));
    }
    for puller in pullers {
        puller.await.unwrap();
    }

    let served = served.lock().unwrap().clone();
    assert_eq!(served.len(), CALLERS);
    assert!(served.windows(2).all(|w| w[0] < w[1]), "{served:?}");

    sync.close();
    worker.await.unwrap();
    assert!(matches!(sync.push(|_| Ok(())), Err(SyncError::Closed)));

    root.stop();
    root.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_releases_unpulled_tokens() {
    let root = echo_network();
    root.start().unwrap();
    let sync = Synchronizer::new(root.main().out_port().clone(), root.main().in_port().clone());
    let worker = sync.spawn_worker().unwrap();

    let token = sync.push(|out| out.push(Value::Number(1.0))).unwrap();
    sync.close();
    worker.await.unwrap();
    assert!(matches!(sync.pull(token, |_| ()), Err(SyncError::Closed)));

    root.stop();
    root.wait().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callers_beyond_queue_capacity_complete() {
    let root = echo_network();
    root.start().unwrap();
    let sync = Synchronizer::new(root.main().out_port().clone(), root.main().in_port().clone());
    let worker = sync.spawn_worker().unwrap();

    let mut callers = Vec::new();
    for i in 0..LOADED_CALLERS {
        let sync = sync.clone();
        callers.push(std::thread::spawn(move || {
            let payload = i as f64;
            let token = sync.push(|out| out.push(Value::Number(payload)))?;
            std::thread::sleep(Duration::from_millis(50));
            let reply = sync.pull(token, |input| input.pull_number())??;
            Ok::<_, SyncError>((reply, payload))
        }));
    }

    let joined = tokio::time::timeout(
        Duration::from_secs(30),
        tokio::task::spawn_blocking(move || {
            callers
                .into_iter()
                .map(|caller| caller.join().unwrap())
                .collect::<Vec<_>>()
        }),
    )
    .await
    .expect("callers stalled under back-pressure")
    .unwrap();

    assert_eq!(joined.len(), LOADED_CALLERS);
    for result in joined {
        let (reply, payload) = result.unwrap();
        assert_eq!(reply, payload);
    }

    sync.close();
    worker.await.unwrap();
    root.stop();
    root.wait().await;
}
