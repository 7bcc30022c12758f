use std::collections::HashMap;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use strum::IntoEnumIterator;
use tracing::info;

use super::explorer::{ExplorerInterface, ProviderRoutes};
use super::multi_chain::MultiChainExplorer;
use super::retry::RetryPolicy;
use super::scanner::{BlockRangeScanner, ScannerSettings};
use crate::adapters::config::{AppConfig, ConfigError};
use crate::ports::{CursorStore, OperationKind, ProviderEntry};

/// Wires every configured chain to its providers. Each provider is built once per chain, so the
/// operations it serves share one HTTP pool and one rate limiter.
pub fn build_explorer(
    config: &AppConfig,
    cursor_store: Arc<dyn CursorStore>,
) -> error_stack::Result<MultiChainExplorer, ConfigError> {
    let retry = RetryPolicy::from(&config.retry);
    let mut multi = MultiChainExplorer::new();

    for (chain_id, chain_config) in &config.chains {
        let chain = Arc::new(chain_config.to_spec(chain_id)?);
        let mut built: HashMap<&str, ProviderEntry> = HashMap::new();
        let mut routes = ProviderRoutes::new();

        for operation in OperationKind::iter() {
            for provider_id in chain_config.operations.for_operation(operation) {
                let provider_config = config.providers.get(provider_id).ok_or_else(|| {
                    Report::new(ConfigError::UnknownProvider {
                        chain: chain_id.clone(),
                        provider: provider_id.clone(),
                    })
                })?;
                let entry = match built.get(provider_id.as_str()) {
                    Some(entry) => entry.clone(),
                    None => {
                        let entry = provider_config
                            .kind
                            .build(provider_id, provider_config, chain.clone())
                            .change_context_lazy(|| ConfigError::ProviderSetup(provider_id.clone()))
                            .attach_printable_lazy(|| format!("Chain: {chain_id}"))?;
                        built.insert(provider_id.as_str(), entry.clone());
                        entry
                    }
                };
                if !entry.client.supports(operation) {
                    return Err(Report::new(ConfigError::UnsupportedOperation {
                        provider: provider_id.clone(),
                        operation,
                    }))
                    .attach_printable(format!("Kind: {}", provider_config.kind))
                    .attach_printable(format!("Chain: {chain_id}"));
                }
                routes.push(operation, entry);
            }
        }

        let mut settings = ScannerSettings::from(&config.scanner);
        if let Some(max_blocks) = chain_config.max_blocks_per_scan {
            settings.max_blocks_per_scan = max_blocks.max(1);
        }
        info!(chain = %chain_id, providers = built.len(), "Chain configured");

        let explorer = Arc::new(ExplorerInterface::new(chain, routes, retry.clone()));
        multi.insert(BlockRangeScanner::new(explorer, cursor_store.clone(), settings));
    }

    Ok(multi)
}
