//! Patience-based early stopping on validation F1.

/// What the trainer should do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// New best score.
    Improved,
    /// No improvement for this many consecutive epochs.
    Stalled(usize),
    /// Patience exhausted.
    Stop,
}

/// Tracks the best score and the number of epochs since it was reached.
/// Only a strictly higher score counts as an improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: Option<(usize, f64)>,
    stall: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience: patience.max(1),
            best: None,
            stall: 0,
        }
    }

    pub fn observe(&mut self, epoch: usize, score: f64) -> StopDecision {
        match self.best {
            Some((_, best)) if score <= best => {
                self.stall += 1;
                if self.stall >= self.patience {
                    StopDecision::Stop
                } else {
                    StopDecision::Stalled(self.stall)
                }
            }
            _ => {
                self.best = Some((epoch, score));
                self.stall = 0;
                StopDecision::Improved
            }
        }
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best.map(|(epoch, _)| epoch)
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best.map(|(_, score)| score)
    }
}
