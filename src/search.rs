//! The streamed search driver.
//!
//! A search runs as a producer/consumer pair: a spawned task drives the
//! paged LDAP search and pushes normalized records through a bounded
//! [`queue`](crate::queue) with pause/resume watermarks, while the caller
//! pulls them lazily from [`SearchResults`]. A slow consumer therefore
//! pauses the server-side page stream instead of growing a buffer, and the
//! full result set is never held in memory.
//!
//! The driver also reassembles range-limited multi-valued attributes
//! (`member;range=0-1499` and friends) with follow-up searches on the same
//! connection before an entry is yielded.

use std::{
	collections::HashSet,
	sync::Arc,
};

use ldap3::{
	adapters::{Adapter, EntriesOnly, PagedResults},
	Ldap, Scope, SearchEntry,
};
use tracing::{debug, warn};

use crate::{
	entry::{
		collect_raw, normalize_attribute, parse_range_name, NormalizeContext, RangeAssembly,
		RawValue, Record, DISTINGUISHED_NAME,
	},
	error::Error,
	filter::escape_value_into,
	queue::EventQueue,
	schema::SchemaState,
};

/// What the producer task hands to the consumer side.
#[derive(Debug)]
enum SearchEvent {
	Record(Record),
	Failed(Error),
}

/// The lazy consumer half of a running search.
///
/// Records arrive in server order. Dropping this mid-stream tears the
/// search down: the producer task is woken, abandons the page stream and
/// releases the connection it owns.
#[derive(Debug)]
pub struct SearchResults {
	queue: Arc<EventQueue<SearchEvent>>,
	done: bool,
}

impl SearchResults {
	/// The next normalized record, or `None` once the search completed.
	/// Any failure of the underlying search surfaces here.
	pub async fn next(&mut self) -> Result<Option<Record>, Error> {
		if self.done {
			return Ok(None);
		}
		match self.queue.pop().await {
			Some(SearchEvent::Record(record)) => Ok(Some(record)),
			Some(SearchEvent::Failed(error)) => {
				self.done = true;
				Err(error)
			}
			None => {
				self.done = true;
				Ok(None)
			}
		}
	}
}

impl Drop for SearchResults {
	fn drop(&mut self) {
		self.queue.close();
	}
}

/// Everything a search needs once the filter is compiled; [`spawn`] turns
/// it into a running producer task.
///
/// [`spawn`]: SearchTask::spawn
pub(crate) struct SearchTask {
	pub(crate) ldap: Ldap,
	/// Whether the task owns `ldap` and must unbind it, or the caller
	/// supplied it and keeps it.
	pub(crate) owns_connection: bool,
	pub(crate) schema: Arc<SchemaState>,
	pub(crate) base: String,
	pub(crate) scope: Scope,
	pub(crate) filter: String,
	/// Attribute list sent on the wire.
	pub(crate) attributes: Vec<String>,
	/// Attributes the caller may receive; `None` for select-all.
	pub(crate) requested: Option<HashSet<String>>,
	/// Whether `distinguishedName` was selected explicitly.
	pub(crate) keep_dn: bool,
	pub(crate) page_size: i32,
	/// False while the schema is not initialized: unknown attributes pass
	/// through untyped and ranged attributes are refused.
	pub(crate) strict: bool,
}

impl SearchTask {
	pub(crate) fn spawn(self) -> SearchResults {
		let queue = Arc::new(EventQueue::new());
		let results = SearchResults { queue: Arc::clone(&queue), done: false };
		tokio::spawn(async move {
			let mut task = self;
			if let Err(error) = task.run(&queue).await {
				let _ = queue.push(SearchEvent::Failed(error)).await;
			}
			queue.close();
			if task.owns_connection {
				if let Err(error) = task.ldap.unbind().await {
					warn!(%error, "failed to release the connection after a search");
				}
			}
		});
		results
	}

	async fn run(&self, queue: &EventQueue<SearchEvent>) -> Result<(), Error> {
		// Separate handles to the same multiplexed connection: one drives
		// the page stream, the other issues the follow-up searches for
		// ranged attributes while the stream is open.
		let mut driver = self.ldap.clone();
		let mut aux = self.ldap.clone();
		let adapters: Vec<Box<dyn Adapter<_, _>>> =
			vec![Box::new(EntriesOnly::new()), Box::new(PagedResults::new(self.page_size))];
		let mut search = driver
			.streaming_search_with(
				adapters,
				&self.base,
				self.scope,
				&self.filter,
				self.attributes.clone(),
			)
			.await?;
		while let Some(result_entry) = search.next().await? {
			let entry = SearchEntry::construct(result_entry);
			let record = self.process(entry, &mut aux).await?;
			if queue.push(SearchEvent::Record(record)).await.is_err() {
				debug!("result stream dropped, abandoning the search");
				return Ok(());
			}
		}
		let result = search.finish().await.success()?;
		if !result.text.is_empty() {
			return Err(Error::ServerMessage(result.text));
		}
		if !result.refs.is_empty() {
			return Err(Error::Referral(result.refs));
		}
		Ok(())
	}

	/// Normalize one entry, completing ranged attributes first.
	async fn process(&self, entry: SearchEntry, aux: &mut Ldap) -> Result<Record, Error> {
		let (dn, raw) = collect_raw(entry);
		if raw.is_empty() {
			return Err(Error::entry(
				&dn,
				"entry arrived without attributes; insufficient read permissions?",
			));
		}
		let mut completed = Vec::with_capacity(raw.len());
		for (name, values) in raw {
			match parse_range_name(&name) {
				Some((base, _, to)) => {
					if !self.strict {
						return Err(Error::entry(
							&dn,
							format!("ranged attribute {name:?} before the schema is initialized"),
						));
					}
					let base = base.to_owned();
					let values = self.complete_range(aux, &dn, &base, to, values).await?;
					completed.push((base, values));
				}
				None => completed.push((name, values)),
			}
		}
		let schema = self.schema.attributes.read().await;
		let ctx = NormalizeContext {
			schema: &schema,
			requested: self.requested.as_ref(),
			keep_dn: self.keep_dn,
			strict: self.strict,
		};
		let mut record = Record::new();
		for (name, values) in completed {
			if let Some((name, value)) = normalize_attribute(&dn, name, values, ctx)? {
				record.insert(name, value);
			}
		}
		Ok(record)
	}

	/// Fetch the remaining chunks of a ranged attribute, overlap-verified,
	/// until the server reports the final (`*`) chunk.
	async fn complete_range(
		&self,
		aux: &mut Ldap,
		dn: &str,
		attribute: &str,
		first_to: Option<u64>,
		first_chunk: Vec<RawValue>,
	) -> Result<Vec<RawValue>, Error> {
		let mut assembly = RangeAssembly::begin(first_to, first_chunk);
		let mut filter = String::from("(distinguishedName=");
		escape_value_into(&mut filter, dn);
		filter.push(')');
		while !assembly.is_complete() {
			let offset = assembly.next_offset();
			let ranged_name = format!("{attribute};range={offset}-*");
			debug!(dn, attribute = ranged_name.as_str(), "fetching next ranged chunk");
			let (entries, _result) = aux
				.search(
					dn,
					Scope::Subtree,
					&filter,
					vec![DISTINGUISHED_NAME.to_owned(), ranged_name.clone()],
				)
				.await?
				.success()?;
			let result_entry = entries.into_iter().next().ok_or_else(|| {
				Error::entry(dn, format!("object disappeared while completing {attribute:?}"))
			})?;
			let (_, raw) = collect_raw(SearchEntry::construct(result_entry));
			let chunk = raw.into_iter().find_map(|(name, values)| {
				parse_range_name(&name)
					.filter(|(base, _, _)| *base == attribute)
					.map(|(_, from, to)| (from, to, values))
			});
			let (from, to, values) = chunk.ok_or_else(|| {
				Error::entry(dn, format!("follow-up search returned no chunk for {ranged_name:?}"))
			})?;
			assembly.append(from, to, values).map_err(|message| {
				Error::entry(dn, format!("ranged attribute {attribute:?}: {message}"))
			})?;
		}
		Ok(assembly.into_values())
	}
}
