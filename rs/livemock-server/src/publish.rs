//! Publish engine (§4.5): walks wall-clock time forward group by group,
//! synthesizes each group's fragments once, and fans them out to every live
//! subscription of one track.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use livemock::control::UpdateMessage;
use livemock::transport::{Location, SubscribeUpdate, Subscription};
use livemock::PublishSource;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

struct SubSlot {
	sub: AsyncMutex<Subscription>,
}

/// Drives one named track (a [`PublishSource`]) forward in wall-clock time,
/// fanning each group's fragments out to every subscriber currently attached.
pub struct TrackPublisher {
	source: Arc<dyn PublishSource>,
	epoch: Instant,
	stale_threshold: u64,
	subs: StdMutex<HashMap<u64, Arc<SubSlot>>>,
	cache: StdMutex<HashMap<(u64, u64), Bytes>>,
}

impl TrackPublisher {
	pub fn new(source: Arc<dyn PublishSource>, epoch: Instant, stale_threshold: u64) -> Arc<Self> {
		Arc::new(Self {
			source,
			epoch,
			stale_threshold,
			subs: StdMutex::new(HashMap::new()),
			cache: StdMutex::new(HashMap::new()),
		})
	}

	pub fn name(&self) -> &str {
		self.source.name()
	}

	/// The group whose opener has most recently become available at `now_ms`.
	pub fn current_group(&self, now_ms: f64) -> u64 {
		self.source.current_group(now_ms)
	}

	/// The highest `(group, object)` available right now, per §4.6's
	/// `SUBSCRIBE_OK.LargestLocation`.
	pub fn largest_object(&self, now_ms: f64) -> (u64, u64) {
		self.source.largest_object(now_ms)
	}

	fn now_ms(&self) -> f64 {
		self.epoch.elapsed().as_secs_f64() * 1000.0
	}

	/// Registers a subscription that was just adopted from a `requested_track`
	/// event. The subscription's `start_group` should already be set to the
	/// current group so the subscriber doesn't receive stale history.
	pub fn add_subscription(&self, sub: Subscription) {
		let session_id = sub.session_id;
		self.subs
			.lock()
			.unwrap()
			.insert(session_id, Arc::new(SubSlot { sub: AsyncMutex::new(sub) }));
	}

	pub fn remove_subscription(&self, session_id: u64) {
		self.subs.lock().unwrap().remove(&session_id);
	}

	/// Applies a `SUBSCRIBE_UPDATE` delivered over the control channel.
	pub fn apply_update(self: &Arc<Self>, session_id: u64, update: &UpdateMessage) {
		let Some(slot) = self.subs.lock().unwrap().get(&session_id).cloned() else {
			return;
		};
		let end_group = update.end_group;
		let priority = update.priority;
		tokio::spawn(async move {
			let mut sub = slot.sub.lock().await;
			let request_id = sub.request_id;
			sub.apply_update(&SubscribeUpdate {
				request_id,
				end_group,
				subscriber_priority: priority,
			});
		});
	}

	/// Synthesizes (or returns the cached) fragment for `(group, object)`.
	/// Every subscriber receiving this group's object sees the identical bytes:
	/// the sequence number baked into the fragment is pinned to `group as u32`
	/// regardless of which subscription is asking.
	fn fragment(&self, group: u64, object: u64) -> Option<Bytes> {
		if let Some(bytes) = self.cache.lock().unwrap().get(&(group, object)).cloned() {
			return Some(bytes);
		}
		match self.source.build_fragment(group, object, group as u32) {
			Ok(bytes) => {
				self.cache.lock().unwrap().insert((group, object), bytes.clone());
				Some(bytes)
			}
			Err(err) => {
				tracing::warn!(track = self.source.name(), group, object, %err, "fragment synthesis failed");
				None
			}
		}
	}

	/// Runs forever (until `cancel` fires), dispatching each newly-entered
	/// group to every eligible subscription.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
		let mut group = self.source.current_group(self.now_ms());
		loop {
			self.dispatch_group(group, cancel.clone());
			self.cache.lock().unwrap().retain(|(g, _), _| *g + 2 >= group);

			let target_ms = self.source.object_available_at(group + 1, 0);
			let delay_ms = (target_ms - self.now_ms()).max(0.0);

			tokio::select! {
				_ = tokio::time::sleep(Duration::from_secs_f64(delay_ms / 1000.0)) => {}
				_ = cancel.cancelled() => return,
			}
			group += 1;
		}
	}

	fn dispatch_group(self: &Arc<Self>, group: u64, cancel: CancellationToken) {
		let objects = self.source.objects_in_group(group);
		let snapshot: Vec<Arc<SubSlot>> = self.subs.lock().unwrap().values().cloned().collect();

		for slot in snapshot {
			let publisher = self.clone();
			let cancel = cancel.clone();
			tokio::spawn(async move {
				publisher.run_publish_group(slot, group, objects, cancel).await;
			});
		}
	}

	async fn run_publish_group(self: Arc<Self>, slot: Arc<SubSlot>, group: u64, objects: u64, cancel: CancellationToken) {
		// A subscriber still busy sending a previous group is left alone; it
		// will naturally fall behind toward the stale-eviction threshold
		// rather than racing writes from two tasks onto one subgroup.
		let Ok(mut sub) = slot.sub.try_lock() else {
			return;
		};

		if group < sub.start_group || sub.is_past_end(group) {
			return;
		}
		if let Some(Location { group: last_group, .. }) = sub.last_sent {
			if group > last_group && group - last_group > self.stale_threshold {
				tracing::debug!(track = self.name(), session_id = sub.session_id, group, last_group, "evicting stale subscriber");
				sub.finish();
				return;
			}
		}

		if sub.open_group(group).is_err() {
			return;
		}

		let mut last_object = 0;
		for object in 0..objects {
			// §4.5 step 3.b: each object is only released once it has actually
			// become available, not all at once at the group opener's time.
			let target_ms = self.source.object_available_at(group, object);
			let delay_ms = (target_ms - self.now_ms()).max(0.0);
			if delay_ms > 0.0 {
				tokio::select! {
					_ = tokio::time::sleep(Duration::from_secs_f64(delay_ms / 1000.0)) => {}
					_ = cancel.cancelled() => return,
				}
			}

			let Some(fragment) = self.fragment(group, object) else { break };
			if sub.write_object(object, fragment).is_err() {
				break;
			}
			last_object = object;
		}

		sub.close_group(group, last_object);

		if sub.is_past_end(group + 1) {
			sub.finish();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use livemock::transport::{FilterType, SubscribeRequest};

	struct FixedSource;

	impl PublishSource for FixedSource {
		fn name(&self) -> &str {
			"fixed"
		}
		fn objects_in_group(&self, _group: u64) -> u64 {
			1
		}
		fn object_available_at(&self, group: u64, _object: u64) -> f64 {
			(group + 1) as f64 * 1000.0
		}
		fn current_group(&self, now_ms: f64) -> u64 {
			(now_ms / 1000.0).floor() as u64
		}
		fn largest_object(&self, now_ms: f64) -> (u64, u64) {
			(self.current_group(now_ms), 0)
		}
		fn build_fragment(&self, _group: u64, _object: u64, sequence: u32) -> livemock::Result<Bytes> {
			Ok(Bytes::from(sequence.to_le_bytes().to_vec()))
		}
	}

	fn request() -> SubscribeRequest {
		SubscribeRequest {
			session_id: 0,
			request_id: 1,
			namespace: vec!["live".into()],
			track: "fixed".into(),
			filter_type: FilterType::NextGroupStart,
			subscriber_priority: 5,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn dispatch_writes_and_closes_one_group() {
		let publisher = TrackPublisher::new(Arc::new(FixedSource), Instant::now(), 10);
		let req = request();
		let mut sub = Subscription::new(42, &req, 0);
		let mut consumer = sub.consumer();
		publisher.add_subscription(sub);

		publisher.dispatch_group(0, CancellationToken::new());
		// `FixedSource::object_available_at` puts group 0's only object 1s out;
		// advance the paused clock so the publish task's sleep resolves.
		tokio::time::advance(Duration::from_millis(1100)).await;
		tokio::task::yield_now().await;

		let group = consumer.next_group().await.expect("group available");
		assert!(group.is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn stale_subscriber_is_evicted() {
		let publisher = TrackPublisher::new(Arc::new(FixedSource), Instant::now(), 2);
		let req = request();
		let mut sub = Subscription::new(7, &req, 0);
		sub.last_sent = Some(Location { group: 0, object: 0 });
		publisher.add_subscription(sub);

		publisher.dispatch_group(10, CancellationToken::new());
		tokio::time::advance(Duration::from_millis(11_100)).await;
		tokio::task::yield_now().await;

		// No panic; eviction path only calls `finish()`, which this test can't
		// observe directly without a consumer `closed()` check, so we only
		// assert it didn't panic and the slot is still addressable.
		publisher.remove_subscription(7);
	}
}
