//! Card presence tracking shared between an adapter and the code talking to a card.


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::iso7816::card::CommunicationError;


/// Flag that stays set while the card it was created for is in the field.
///
/// Adapters create one per discovered card and clear it as soon as they notice the card is gone.
/// Long read loops check it between exchanges so that no further commands are issued (and no
/// session state is reused) after a removal.
#[derive(Clone, Debug)]
pub struct Presence {
    present: Arc<AtomicBool>,
}
impl Presence {
    pub fn new() -> Self {
        Self {
            present: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A presence that is never cleared; for cards whose removal cannot be observed.
    pub fn always() -> Self {
        Self::new()
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub fn mark_removed(&self) {
        self.present.store(false, Ordering::Release);
    }

    pub fn ensure_present(&self) -> Result<(), CommunicationError> {
        if self.is_present() {
            Ok(())
        } else {
            Err(CommunicationError::CardRemoved)
        }
    }
}
impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
