use collection_sync::{
	Document, Entity, FetchConfig, MemoryStore, PageFetcher, PageNumberScheme, RemoteRecord,
	SyncCallbacks, SyncConfig, SyncOrchestrator, SyncTarget, TracingObserver,
};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_URL: &str = "https://api.github.com/repositories";

/// Copy the fields the demo keeps for each repository or user.
fn fill_entity(entity: &mut Document, record: &RemoteRecord) {
	let name = record
		.get_str("name")
		.or_else(|| record.get_str("first_name"))
		.map(str::to_string);
	let initial = name
		.as_deref()
		.and_then(|name| name.chars().next())
		.map(|c| c.to_uppercase().to_string())
		.unwrap_or_default();

	entity.update_if_changed("name", name);
	entity.update_if_changed("name_initial", initial);
	entity.update_if_changed("full_name", record.get("full_name").cloned());
	entity.update_if_changed("email", record.get("email").cloned());
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	// Initialize tracing subscriber
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let url = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_URL.to_string());
	info!("Starting collection sync of {}", url);

	let mut target = SyncTarget::new(url).with_page_size(100);
	if let Ok(token) = std::env::var("SYNC_TOKEN") {
		target = target.with_bearer_token(token);
	}

	// Bodies wrapped in an object, paginated by page counter
	let mut fetch_config = FetchConfig::default();
	if let Ok(field) = std::env::var("SYNC_RECORDS_FIELD") {
		fetch_config = fetch_config
			.with_records_field(field)
			.with_page_numbers(PageNumberScheme::default());
	}

	let store = match std::env::var("SYNC_STORE") {
		Ok(path) => match MemoryStore::open(path).await {
			Ok(store) => store,
			Err(e) => {
				error!("Failed to open store: {}", e);
				std::process::exit(1);
			}
		},
		Err(_) => MemoryStore::new(),
	};
	let store = Arc::new(store);

	let fetcher = match PageFetcher::with_reqwest(fetch_config) {
		Ok(fetcher) => fetcher,
		Err(e) => {
			error!("Failed to create HTTP client: {}", e);
			std::process::exit(1);
		}
	};

	info!("Created page fetcher");

	let callbacks = SyncCallbacks::upsert(fill_entity, |had_changes| {
		info!("Sync finished, local store changed: {}", had_changes);
	})
	.with_removal_candidate(|entity: &mut Document| {
		warn!(
			"No longer present remotely: {}",
			entity.get("name").and_then(|name| name.as_str()).unwrap_or("<unnamed>")
		);
	})
	.with_on_aborted(|e| error!("Sync aborted: {}", e));

	let mut orchestrator =
		SyncOrchestrator::new(fetcher, Arc::clone(&store), target, callbacks).with_config(SyncConfig::default());
	orchestrator.register_handler(Arc::new(TracingObserver));

	match orchestrator.sync().await {
		Ok(report) => {
			info!("{}", report.summary());
			info!("Local store holds {} entities", store.len());
		}
		Err(e) => {
			error!("Sync failed: {}", e);
			std::process::exit(1);
		}
	}
}
