use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;

use super::{establish::ConnectionEstablisher, ConnectionPool};
use crate::{
    bson::{doc, oid::ObjectId},
    error::Error,
    event::cmap::{CmapEvent, CmapEventHandler, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    options::{ClusterOptions, ServerAddress},
    sdam::TopologyUpdater,
    test::{standalone_reply, EventBuffer, MockConnector, MockServer},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn address() -> ServerAddress {
    ServerAddress::parse("pool-test:27017").unwrap()
}

fn options(events: &EventBuffer) -> ClusterOptions {
    let handler: Arc<dyn CmapEventHandler> = Arc::new(events.clone());
    ClusterOptions::builder()
        .hosts(vec![address()])
        .cmap_event_handler(handler)
        .build()
}

fn new_pool(connector: &MockConnector, options: &ClusterOptions) -> ConnectionPool {
    let (updater, _) = TopologyUpdater::channel();
    ConnectionPool::new(
        address(),
        ConnectionEstablisher::new(Arc::new(connector.clone()), options),
        updater,
        ObjectId::new(),
        options,
    )
}

fn healthy_connector() -> MockConnector {
    MockConnector::new().with(&address(), MockServer::Reply(standalone_reply()))
}

fn closed_for(reason: ConnectionClosedReason) -> impl Fn(&CmapEvent) -> bool {
    move |event| matches!(event, CmapEvent::ConnectionClosed(e) if e.reason == reason)
}

#[tokio::test]
async fn paused_pool_rejects_checkout() {
    let events = EventBuffer::new();
    let pool = new_pool(&healthy_connector(), &options(&events));

    let error = pool.check_out(Some(TIMEOUT)).await.unwrap_err();
    assert!(error.is_pool_cleared(), "{error}");

    assert_eq!(
        events.count_cmap(|e| matches!(
            e,
            CmapEvent::ConnectionCheckoutFailed(e)
                if e.reason == ConnectionCheckoutFailedReason::PoolCleared
        )),
        1
    );
}

#[tokio::test]
async fn clear_bumps_generation_and_pauses() {
    let events = EventBuffer::new();
    let pool = new_pool(&healthy_connector(), &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let connection = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_eq!(connection.generation(), 0);
    assert!(connection.stream_description().is_ok());

    pool.clear(std::io::ErrorKind::ConnectionReset.into()).await;
    assert_eq!(pool.generation(), 1);
    assert!(events.count_cmap(|e| matches!(e, CmapEvent::PoolCleared(e) if e.generation == 1)) == 1);

    let error = pool.check_out(Some(TIMEOUT)).await.unwrap_err();
    assert!(error.is_pool_cleared(), "{error}");

    // Checking in a connection from before the clear closes it.
    drop(connection);
    assert!(
        events
            .wait_for_cmap(TIMEOUT, closed_for(ConnectionClosedReason::Stale))
            .await
    );

    pool.mark_as_ready().wait_for_acknowledgment().await;
    let connection = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_eq!(connection.generation(), 1);
}

#[tokio::test]
async fn stale_connection_is_never_checked_out() {
    let events = EventBuffer::new();
    let pool = new_pool(&healthy_connector(), &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let first = pool.check_out(Some(TIMEOUT)).await.unwrap();
    let first_id = first.id();
    drop(first);

    // A non-network cause leaves the idle connection in place to be discarded lazily.
    pool.clear(Error::internal("clear for test")).await;
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let second = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(second.generation(), pool.generation());
    assert_eq!(events.count_cmap(closed_for(ConnectionClosedReason::Stale)), 1);
}

#[tokio::test]
async fn checked_in_connection_is_reused() {
    let connector = healthy_connector();
    let events = EventBuffer::new();
    let pool = new_pool(&connector, &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let first = pool.check_out(Some(TIMEOUT)).await.unwrap();
    let first_id = first.id();
    drop(first);

    let second = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_eq!(second.id(), first_id);
    assert_eq!(connector.connections_opened(&address()), 1);
    assert_eq!(
        events.count_cmap(|e| matches!(e, CmapEvent::ConnectionCheckedIn(_))),
        1
    );
}

#[tokio::test]
async fn full_pool_times_out_waiters() {
    let events = EventBuffer::new();
    let mut options = options(&events);
    options.max_pool_size = Some(1);
    let pool = new_pool(&healthy_connector(), &options);
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let held = pool.check_out(Some(TIMEOUT)).await.unwrap();

    let error = pool
        .check_out(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(error.is_wait_queue_timeout(), "{error}");
    assert_eq!(
        events.count_cmap(|e| matches!(
            e,
            CmapEvent::ConnectionCheckoutFailed(e)
                if e.reason == ConnectionCheckoutFailedReason::Timeout
        )),
        1
    );

    // A waiter is served as soon as the held connection comes back.
    let held_id = held.id();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.check_out(Some(TIMEOUT)).await.map(|c| c.id()) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), held_id);
}

#[tokio::test]
async fn establishment_failure_is_reported() {
    let connector = MockConnector::new().with(&address(), MockServer::Fail);
    let events = EventBuffer::new();
    let pool = new_pool(&connector, &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let error = pool.check_out(Some(TIMEOUT)).await.unwrap_err();
    assert!(error.is_network_error(), "{error}");

    assert!(
        events
            .wait_for_cmap(TIMEOUT, |e| matches!(
                e,
                CmapEvent::ConnectionClosed(e)
                    if e.reason == ConnectionClosedReason::Error && e.error.is_some()
            ))
            .await
    );
    assert_eq!(
        events.count_cmap(|e| matches!(
            e,
            CmapEvent::ConnectionCheckoutFailed(e)
                if e.reason == ConnectionCheckoutFailedReason::ConnectionError
        )),
        1
    );
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let events = EventBuffer::new();
    let mut options = options(&events);
    options.max_idle_time = Some(Duration::from_millis(50));
    let pool = new_pool(&healthy_connector(), &options);
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let first = pool.check_out(Some(TIMEOUT)).await.unwrap();
    let first_id = first.id();
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(events.count_cmap(closed_for(ConnectionClosedReason::Idle)), 1);
}

#[tokio::test]
async fn ready_pool_maintains_min_pool_size() {
    let connector = healthy_connector();
    let events = EventBuffer::new();
    let mut options = options(&events);
    options.min_pool_size = Some(2);
    let pool = new_pool(&connector, &options);
    pool.mark_as_ready().wait_for_acknowledgment().await;

    assert!(
        crate::test::wait_until(TIMEOUT, || connector.connections_opened(&address()) == 2).await
    );
    assert!(
        crate::test::wait_until(TIMEOUT, || {
            events.count_cmap(|e| matches!(e, CmapEvent::ConnectionReady(_))) == 2
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both background connections are handed out before any new one is opened.
    let _first = pool.check_out(Some(TIMEOUT)).await.unwrap();
    let _second = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_eq!(connector.connections_opened(&address()), 2);
}

#[tokio::test]
async fn errored_connection_is_closed_on_check_in() {
    let connector = healthy_connector();
    let events = EventBuffer::new();
    let pool = new_pool(&connector, &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let mut connection = pool.check_out(Some(TIMEOUT)).await.unwrap();
    connector.set(&address(), MockServer::Fail);
    assert!(connection.send_command(doc! { "ping": 1 }).await.is_err());
    drop(connection);
    assert!(
        events
            .wait_for_cmap(TIMEOUT, closed_for(ConnectionClosedReason::Error))
            .await
    );

    connector.set(&address(), MockServer::Reply(standalone_reply()));
    let replacement = pool.check_out(Some(TIMEOUT)).await.unwrap();
    assert_eq!(replacement.id(), 2);
    assert_eq!(connector.connections_opened(&address()), 2);
}

#[tokio::test]
async fn at_most_two_connections_establish_at_once() {
    let connector = MockConnector::new().with(
        &address(),
        MockServer::Slow(standalone_reply(), Duration::from_millis(300)),
    );
    let events = EventBuffer::new();
    let pool = new_pool(&connector, &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;

    let checkouts: Vec<_> = (0..4)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.check_out(Some(TIMEOUT)).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        events.count_cmap(|e| matches!(e, CmapEvent::ConnectionCreated(_))),
        2
    );

    // Every connection stays checked out, so none can be handed to another waiter.
    let mut held = Vec::new();
    for checkout in checkouts {
        held.push(checkout.await.unwrap().unwrap());
    }
    let mut ids: Vec<_> = held.iter().map(|c| c.id()).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn dropping_pool_closes_it() {
    let events = EventBuffer::new();
    let pool = new_pool(&healthy_connector(), &options(&events));
    pool.mark_as_ready().wait_for_acknowledgment().await;
    drop(pool.check_out(Some(TIMEOUT)).await.unwrap());
    drop(pool);

    assert!(
        events
            .wait_for_cmap(TIMEOUT, |e| matches!(e, CmapEvent::PoolClosed(_)))
            .await
    );
    assert_eq!(events.count_cmap(closed_for(ConnectionClosedReason::PoolClosed)), 1);
}
