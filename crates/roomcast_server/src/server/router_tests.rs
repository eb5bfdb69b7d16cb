#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use roomcast_domain::{ChangeEvent, Group, Message, MessageId, RoomId, UserId, UserProfile};
use roomcast_protocol::{NotificationBody, ServerEvent};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::time::timeout;

use crate::server::room_hub::{RoomHub, RoomHubConfig};
use crate::server::router::{ChangeRouter, RouterConfig};
use crate::server::state::SubscriptionState;

fn profile(id: i64) -> UserProfile {
	UserProfile {
		id: UserId::new(id),
		email: format!("u{id}@example.com"),
		username: format!("u{id}"),
	}
}

fn message(room: i64, text: &str) -> Message {
	Message {
		id: MessageId::new(1),
		room: RoomId::new(room),
		author: profile(2),
		text: text.to_string(),
		created_at: 1_706_790_645_000,
	}
}

struct Fixture {
	hub: RoomHub,
	subs: Arc<RwLock<SubscriptionState>>,
	router: ChangeRouter,
}

fn fixture() -> Fixture {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});
	let subs = Arc::new(RwLock::new(SubscriptionState::default()));
	let (_tx, rx) = broadcast::channel(16);
	let router = ChangeRouter::new(rx, hub.clone(), Arc::clone(&subs), RouterConfig::default());

	Fixture { hub, subs, router }
}

async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
	timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("channel open")
}

async fn assert_silent(rx: &mut mpsc::Receiver<ServerEvent>) {
	let unexpected = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(unexpected.is_err(), "unexpected frame: {unexpected:?}");
}

#[tokio::test]
async fn one_tagged_frame_per_correlation_id() {
	let f = fixture();
	let group = Group::room(RoomId::new(7));

	let mut rx = f.hub.register_conn(1).await;
	f.hub.join(group, 1).await;
	{
		let mut subs = f.subs.write().await;
		subs.subscribe(1, "tab-1", group);
		subs.subscribe(1, "tab-2", group);
	}

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "hi"))).await;

	let mut request_ids = Vec::new();
	for _ in 0..2 {
		match recv(&mut rx).await {
			ServerEvent::ChatMessage { request_id, message } => {
				assert_eq!(message.text, "hi");
				request_ids.push(request_id.expect("tagged frame"));
			}
			other => panic!("expected chat_message, got: {other:?}"),
		}
	}
	request_ids.sort();
	assert_eq!(request_ids, vec!["tab-1".to_string(), "tab-2".to_string()]);

	// Exactly one frame per correlation id, never more.
	assert_silent(&mut rx).await;
}

#[tokio::test]
async fn plain_group_member_gets_one_untagged_frame() {
	let f = fixture();
	let group = Group::room(RoomId::new(7));

	let mut rx = f.hub.register_conn(1).await;
	f.hub.join(group, 1).await;

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "hello"))).await;

	match recv(&mut rx).await {
		ServerEvent::ChatMessage { request_id, message } => {
			assert_eq!(request_id, None);
			assert_eq!(message.text, "hello");
		}
		other => panic!("expected chat_message, got: {other:?}"),
	}
	assert_silent(&mut rx).await;
}

#[tokio::test]
async fn unsubscribed_id_is_not_delivered_again() {
	let f = fixture();
	let group = Group::room(RoomId::new(7));

	let mut rx = f.hub.register_conn(1).await;
	f.hub.join(group, 1).await;
	{
		let mut subs = f.subs.write().await;
		subs.subscribe(1, "tab-1", group);
		subs.subscribe(1, "tab-2", group);
	}

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "first"))).await;
	recv(&mut rx).await;
	recv(&mut rx).await;

	{
		let mut subs = f.subs.write().await;
		subs.unsubscribe(1, "tab-1", &group);
	}

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "second"))).await;

	match recv(&mut rx).await {
		ServerEvent::ChatMessage { request_id, .. } => assert_eq!(request_id.as_deref(), Some("tab-2")),
		other => panic!("expected chat_message, got: {other:?}"),
	}
	assert_silent(&mut rx).await;
}

#[tokio::test]
async fn late_subscribers_miss_earlier_changes() {
	let f = fixture();
	let group = Group::room(RoomId::new(7));

	let mut rx = f.hub.register_conn(1).await;

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "early"))).await;

	f.hub.join(group, 1).await;
	{
		let mut subs = f.subs.write().await;
		subs.subscribe(1, "tab-1", group);
	}

	assert_silent(&mut rx).await;
}

#[tokio::test]
async fn torn_down_connection_is_never_referenced() {
	let f = fixture();
	let group = Group::room(RoomId::new(7));

	let mut rx = f.hub.register_conn(1).await;
	f.hub.join(group, 1).await;
	{
		let mut subs = f.subs.write().await;
		subs.subscribe(1, "tab-1", group);
	}

	// Teardown order: subscriptions first, then fabric membership.
	{
		let mut subs = f.subs.write().await;
		subs.remove_conn(1);
	}
	f.hub.remove_conn(1).await;

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "late"))).await;
	assert_silent(&mut rx).await;
}

#[tokio::test]
async fn membership_change_reaches_room_and_user_groups() {
	let f = fixture();
	let room = RoomId::new(7);
	let joiner = profile(9);

	// Connection 1 watches the room with a correlation id; connection 2 is
	// the joiner's notification stream.
	let mut rx_room = f.hub.register_conn(1).await;
	f.hub.join(Group::room(room), 1).await;
	{
		let mut subs = f.subs.write().await;
		subs.subscribe(1, "tab-1", Group::room(room));
	}

	let mut rx_user = f.hub.register_conn(2).await;
	f.hub.join(Group::user(joiner.id), 2).await;

	f.router
		.dispatch(ChangeEvent::MemberAdded {
			room,
			user: joiner.clone(),
		})
		.await;

	match recv(&mut rx_room).await {
		ServerEvent::Notification { request_id, body } => {
			assert_eq!(request_id.as_deref(), Some("tab-1"));
			assert_eq!(
				body,
				NotificationBody::MemberAdded {
					pk: room,
					user: (&joiner).into(),
				}
			);
		}
		other => panic!("expected notification, got: {other:?}"),
	}

	match recv(&mut rx_user).await {
		ServerEvent::Notification { request_id, body } => {
			assert_eq!(request_id, None);
			assert!(matches!(body, NotificationBody::MemberAdded { .. }));
		}
		other => panic!("expected notification, got: {other:?}"),
	}

	assert_silent(&mut rx_room).await;
	assert_silent(&mut rx_user).await;
}

#[tokio::test]
async fn dead_subscriber_does_not_abort_the_fan_out() {
	let f = fixture();
	let group = Group::room(RoomId::new(7));

	{
		let _rx_dead = f.hub.register_conn(1).await;
		f.hub.join(group, 1).await;
	}
	let mut rx_live = f.hub.register_conn(2).await;
	f.hub.join(group, 2).await;
	{
		let mut subs = f.subs.write().await;
		subs.subscribe(1, "tab-1", group);
		subs.subscribe(2, "tab-2", group);
	}

	f.router.dispatch(ChangeEvent::MessageCreated(message(7, "still here"))).await;

	match recv(&mut rx_live).await {
		ServerEvent::ChatMessage { request_id, message } => {
			assert_eq!(request_id.as_deref(), Some("tab-2"));
			assert_eq!(message.text, "still here");
		}
		other => panic!("expected chat_message, got: {other:?}"),
	}
}

#[tokio::test]
async fn router_task_consumes_the_change_broadcast() {
	let hub = RoomHub::new(RoomHubConfig {
		subscriber_queue_capacity: 16,
		debug_logs: false,
	});
	let subs = Arc::new(RwLock::new(SubscriptionState::default()));
	let (tx, rx) = broadcast::channel(16);

	let router = ChangeRouter::new(rx, hub.clone(), Arc::clone(&subs), RouterConfig::default());
	let handle = tokio::spawn(router.run());

	let group = Group::room(RoomId::new(3));
	let mut rx_conn = hub.register_conn(1).await;
	hub.join(group, 1).await;

	tx.send(ChangeEvent::MessageCreated(message(3, "routed"))).expect("send");

	match recv(&mut rx_conn).await {
		ServerEvent::ChatMessage { message, .. } => assert_eq!(message.text, "routed"),
		other => panic!("expected chat_message, got: {other:?}"),
	}

	drop(tx);
	timeout(Duration::from_millis(250), handle)
		.await
		.expect("router exits when upstream closes")
		.expect("router task");
}
