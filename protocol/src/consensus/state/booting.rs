//! Booting: read local storage, check the tip, position the home state.

use tracing::{error, info};

use super::{HandlerResult, Scope, Transition};
use crate::consensus::home::{HomeState, NodeState};
use crate::storage::{Block, BlockStore};

#[derive(Debug, Default)]
pub struct BootingHandler;

impl BootingHandler {
    pub fn new() -> Self {
        Self
    }

    pub(super) fn enter(&mut self, scope: &mut Scope<'_>) -> HandlerResult {
        let store = scope.ctx.store.as_ref();

        let tip = match load_tip(store) {
            Ok(tip) => tip,
            Err(reason) => {
                error!(node = %scope.ctx.node, %reason, "local storage is unusable");
                return Ok(Some(Transition::Stopped { reason }));
            }
        };

        scope
            .ctx
            .home
            .reset(HomeState::after(&tip, NodeState::Booting));
        info!(
            node = %scope.ctx.node,
            tip = tip.height(),
            hash = %tip.hash(),
            "storage validated"
        );
        Ok(Some(Transition::Join))
    }
}

/// Read and check the stored tip, writing genesis into an empty store.
fn load_tip(store: &dyn BlockStore) -> Result<Block, String> {
    let tip = match store.last_block().map_err(|e| e.to_string())? {
        Some(tip) => tip,
        None => {
            let genesis = Block::genesis();
            store.commit(&genesis).map_err(|e| e.to_string())?;
            info!(hash = %genesis.hash(), "wrote genesis block");
            genesis
        }
    };

    tip.verify().map_err(|e| e.to_string())?;
    if tip.height() > 0 {
        let parent = store
            .block(tip.height() - 1)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("missing parent of block {}", tip.height()))?;
        tip.verify_link(&parent).map_err(|e| e.to_string())?;
    }
    Ok(tip)
}
