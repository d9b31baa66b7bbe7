//! 连接监管器：并发建连收敛、按接口闸门、摘除与断连。

mod support;

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use futures::executor::block_on;
use spark_rpc_client::{
    Channel, ClientOptions, ConnectOptions, ConnectOutcome, ConnectionStatus, ConnectionSupervisor,
    FirstAvailable, ResultCode, RpcClient, RpcError,
};
use support::{Ignore, MockConnector, Reply, addr};

fn supervisor(connector: &Arc<MockConnector>) -> Arc<ConnectionSupervisor> {
    Arc::new(ConnectionSupervisor::new(
        Arc::clone(connector) as _,
        Arc::new(FirstAvailable),
        ConnectOptions::default(),
        Arc::new(Ignore),
    ))
}

#[test]
fn concurrent_adds_for_one_address_converge() {
    let connector = MockConnector::with_delay(Reply::Silent, Duration::from_millis(50));
    let supervisor = supervisor(&connector);
    let address = addr(7001);

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            let address = address.clone();
            thread::spawn(move || block_on(supervisor.add_connection("demo.Echo", &address)))
        })
        .collect();
    let outcomes: Vec<_> = callers
        .into_iter()
        .map(|caller| caller.join().expect("caller thread").expect("no failure"))
        .collect();

    let established = outcomes
        .iter()
        .filter(|outcome| **outcome == ConnectOutcome::Established)
        .count();
    assert_eq!(established, 1, "{outcomes:?}");
    assert!(outcomes.iter().all(|outcome| matches!(
        outcome,
        ConnectOutcome::Established | ConnectOutcome::InFlight | ConnectOutcome::AlreadyActive
    )));
    assert_eq!(connector.connects(), 1);
    assert_eq!(supervisor.connection_count(), 1);
    assert_eq!(supervisor.addresses("demo.Echo"), vec![address.clone()]);
    assert_eq!(supervisor.status(&address), Some(ConnectionStatus::Active));
}

#[test]
fn interfaces_joining_an_attempt_are_published_together() {
    let connector = MockConnector::with_delay(Reply::Silent, Duration::from_millis(50));
    let supervisor = supervisor(&connector);
    let address = addr(7002);

    let first = {
        let (supervisor, address) = (Arc::clone(&supervisor), address.clone());
        thread::spawn(move || block_on(supervisor.add_connection("demo.Echo", &address)))
    };
    thread::sleep(Duration::from_millis(10));
    assert_eq!(
        block_on(supervisor.add_connection("demo.Clock", &address)),
        Ok(ConnectOutcome::InFlight)
    );
    assert_eq!(
        first.join().expect("first caller"),
        Ok(ConnectOutcome::Established)
    );
    assert!(supervisor.is_ready("demo.Echo"));
    assert!(supervisor.is_ready("demo.Clock"));
    assert_eq!(supervisor.addresses("demo.Clock"), vec![address]);
}

#[test]
fn selection_waits_per_interface() {
    let connector = MockConnector::new(Reply::Silent);
    let supervisor = supervisor(&connector);
    let released = Arc::new(AtomicUsize::new(0));

    let alpha: Vec<_> = (0..3)
        .map(|_| {
            let (supervisor, released) = (Arc::clone(&supervisor), Arc::clone(&released));
            thread::spawn(move || {
                let channel = supervisor.select_channel("demo.Alpha");
                released.fetch_add(1, Ordering::SeqCst);
                channel
            })
        })
        .collect();
    let beta = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.select_channel_within("demo.Beta", Duration::from_millis(300)))
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(released.load(Ordering::SeqCst), 0, "alpha callers are gated");

    block_on(supervisor.add_connection("demo.Alpha", &addr(7003))).expect("established");
    for caller in alpha {
        let channel = caller.join().expect("alpha caller").expect("alpha channel");
        assert_eq!(channel.remote_address(), &addr(7003));
    }
    assert!(matches!(
        beta.join().expect("beta caller"),
        Err(RpcError::ReadinessTimeout { .. })
    ));
    assert!(!supervisor.is_ready("demo.Beta"));
}

#[test]
fn async_selection_is_released_by_connection() {
    let connector = MockConnector::new(Reply::Silent);
    let supervisor = supervisor(&connector);
    let waiter = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || block_on(supervisor.select_channel_async("demo.Async")))
    };
    thread::sleep(Duration::from_millis(20));
    block_on(supervisor.add_connection("demo.Async", &addr(7004))).expect("established");
    assert!(waiter.join().expect("async waiter").is_ok());
}

#[test]
fn failed_connection_keeps_gate_closed() {
    let connector = MockConnector::new(Reply::Silent);
    let refused = addr(7005);
    connector.refuse(&refused);
    let supervisor = supervisor(&connector);

    let err = block_on(supervisor.add_connection("demo.Echo", &refused)).expect_err("refused");
    assert!(matches!(err, RpcError::ConnectionFailed { ref address, .. } if *address == refused));
    assert_eq!(err.code(), "rpc.connection.failed");
    assert!(!supervisor.is_ready("demo.Echo"));
    assert_eq!(supervisor.status(&refused), None);
}

#[test]
fn removal_during_handshake_withdraws_attempt() {
    let connector = MockConnector::with_delay(Reply::Silent, Duration::from_millis(80));
    let supervisor = supervisor(&connector);
    let address = addr(7006);

    let attempt = {
        let (supervisor, address) = (Arc::clone(&supervisor), address.clone());
        thread::spawn(move || block_on(supervisor.add_connection("demo.Echo", &address)))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(supervisor.remove_connection("demo.Echo", &address));

    assert_eq!(attempt.join().expect("attempt"), Ok(ConnectOutcome::Withdrawn));
    assert_eq!(supervisor.connection_count(), 0);
    assert!(supervisor.addresses("demo.Echo").is_empty());
    let channels = connector.channels();
    assert_eq!(channels.len(), 1);
    assert!(!channels[0].is_active(), "orphaned channel is closed");
}

#[test]
fn remote_disconnect_withdraws_until_reconnected() {
    let connector = MockConnector::new(Reply::Silent);
    let supervisor = supervisor(&connector);
    let address = addr(7007);
    block_on(supervisor.add_connection("demo.Echo", &address)).expect("established");

    let channel = connector.channel_to(&address).expect("channel");
    channel.sever();
    // `Ignore` 不转发事件，这里直接把通知交给监管器。
    assert!(supervisor.on_disconnected(&address));
    assert_eq!(supervisor.status(&address), Some(ConnectionStatus::Closed));
    assert!(matches!(
        supervisor.select_channel_within("demo.Echo", Duration::from_millis(10)),
        Err(RpcError::NoReachableAddress { .. })
    ));

    assert_eq!(
        block_on(supervisor.reconnect(&address)),
        Ok(ConnectOutcome::Established)
    );
    assert_eq!(connector.connects(), 2);
    assert!(supervisor.select_channel("demo.Echo").is_ok());
}

#[test]
fn removing_address_with_in_flight_calls_leaves_them_to_timeout() {
    let connector = MockConnector::new(Reply::Silent);
    let client = RpcClient::new(ClientOptions::default(), Arc::clone(&connector) as _)
        .expect("client");
    let address = addr(7008);
    block_on(client.supervisor().add_connection("demo.Echo", &address)).expect("established");

    let calls: Vec<_> = (0..5)
        .map(|_| {
            client
                .send("demo.Echo", "echo", "ping", Duration::from_millis(100), None)
                .expect("sent")
        })
        .collect();
    assert_eq!(client.registry().len(), 5);

    assert!(client.supervisor().remove_connection("demo.Echo", &address));
    assert_eq!(client.supervisor().connection_count(), 0);

    for call in &calls {
        assert_eq!(call.wait().code(), ResultCode::Timeout);
    }
    assert!(client.registry().is_empty());
}
