use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

/// Represents a single node in the Monte Carlo search tree.
///
/// Nodes are shared between the worker threads of one search. The structure is append-only:
/// the children are written exactly once, by whichever thread wins the expansion claim, and
/// never change afterwards. Statistics are updated through atomics, except for the running
/// mean which sits behind a narrow lock.
///
/// A node owns its children. The parent link is weak, so dropping a node drops its whole
/// subtree and promoting a child to root never forms a cycle.
#[derive(Debug)]
pub struct MctsNode {
    parent: RwLock<Weak<MctsNode>>,
    children: OnceLock<Vec<Arc<MctsNode>>>,
    action: Option<usize>,
    prior: f64,
    visits: AtomicU32,
    mean_value: Mutex<f64>,
    virtual_loss: AtomicI32,
    is_claimed: AtomicBool,
    is_leaf: AtomicBool,
}

impl MctsNode {
    /// Creates a detached root with no action and a prior of `1`.
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self::new(Weak::new(), None, 1.0))
    }

    fn new(parent: Weak<MctsNode>, action: Option<usize>, prior: f64) -> Self {
        Self {
            parent: RwLock::new(parent),
            children: OnceLock::new(),
            action,
            prior,
            visits: AtomicU32::new(0),
            mean_value: Mutex::new(0.0),
            virtual_loss: AtomicI32::new(0),
            is_claimed: AtomicBool::new(false),
            is_leaf: AtomicBool::new(true),
        }
    }

    /// The move leading from the parent to this node. `None` for a fresh root.
    pub fn action(&self) -> Option<usize> {
        self.action
    }

    /// Prior probability assigned by the expansion that created this node.
    pub fn prior(&self) -> f64 {
        self.prior
    }

    /// Number of completed playouts through this node.
    pub fn visits(&self) -> u32 {
        self.visits.load(Ordering::Acquire)
    }

    /// Running mean of the backed-up values, seen by the player who moved into this node.
    pub fn mean_value(&self) -> f64 {
        *self.mean_value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of playouts currently in flight below this node.
    pub fn virtual_loss(&self) -> i32 {
        self.virtual_loss.load(Ordering::Acquire)
    }

    /// `true` until the node has been expanded.
    pub fn is_leaf(&self) -> bool {
        self.is_leaf.load(Ordering::Acquire)
    }

    /// The children created by the expansion, or an empty slice for a leaf.
    pub fn children(&self) -> &[Arc<MctsNode>] {
        self.children.get().map_or(&[], Vec::as_slice)
    }

    /// The parent node, or `None` for a root.
    pub fn parent(&self) -> Option<Arc<MctsNode>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    /// Severs the link to the parent, turning this node into a root.
    pub fn detach(&self) {
        *self.parent.write().unwrap_or_else(PoisonError::into_inner) = Weak::new();
    }

    /// Selection score of this node, seen from a parent with `parent_visits` visits.
    ///
    /// Unvisited nodes get the exploration term alone. Visited nodes subtract the virtual
    /// loss from the accumulated value mass before averaging, which may briefly produce a
    /// mean below `-1` while many threads are in flight below this node.
    pub fn get_value(&self, parent_visits: u32, c_puct: f64, c_virtual_loss: f64) -> f64 {
        let visits = self.visits();
        let exploration =
            c_puct * self.prior * f64::from(parent_visits).sqrt() / (1.0 + f64::from(visits));
        if visits == 0 {
            return exploration;
        }

        let n = f64::from(visits);
        let virtual_loss = c_virtual_loss * f64::from(self.virtual_loss());
        (self.mean_value() * n - virtual_loss) / n + exploration
    }

    /// Picks the child with the highest selection score and adds one virtual loss to it.
    ///
    /// Ties go to the first child in expansion order. Returns `None` for a leaf.
    pub fn select(&self, c_puct: f64, c_virtual_loss: f64) -> Option<Arc<MctsNode>> {
        let parent_visits = self.visits();
        let mut best: Option<(&Arc<MctsNode>, f64)> = None;
        for child in self.children() {
            let value = child.get_value(parent_visits, c_puct, c_virtual_loss);
            if best.is_none_or(|(_, max)| value > max) {
                best = Some((child, value));
            }
        }

        let (child, _) = best?;
        child.virtual_loss.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(child))
    }

    /// Creates one child per legal action, with the prior taken from `priors[action]`.
    ///
    /// Only the first caller wins the claim; every other caller is a no-op. Returns `true` for
    /// the caller that performed the expansion.
    pub fn expand(self: &Arc<Self>, priors: &[f64], actions: &[usize]) -> bool {
        if self
            .is_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let children = actions
            .iter()
            .map(|&action| {
                let prior = priors.get(action).copied().unwrap_or(0.0);
                Arc::new(MctsNode::new(Arc::downgrade(self), Some(action), prior))
            })
            .collect();
        // The claim guarantees nobody else ever sets the cell.
        let _ = self.children.set(children);
        self.is_leaf.store(false, Ordering::Release);
        true
    }

    /// Propagates `value` from this node up to the root, negating it at every level.
    pub fn backup(&self, value: f64) {
        let parent = self.parent();
        if parent.is_some() {
            // Roots are never selected, so they carry no virtual loss.
            self.virtual_loss.fetch_sub(1, Ordering::AcqRel);
        }
        let visits = self.visits.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut mean = self.mean_value.lock().unwrap_or_else(PoisonError::into_inner);
            *mean += (value - *mean) / f64::from(visits);
        }

        if let Some(parent) = parent {
            parent.backup(-value);
        }
    }

    /// Removes the virtual loss a selection path added, without recording a visit.
    ///
    /// Used when a playout is abandoned after its leaf evaluation failed.
    pub fn revert_virtual_loss(&self) {
        let Some(mut parent) = self.parent() else {
            return;
        };
        self.virtual_loss.fetch_sub(1, Ordering::AcqRel);
        while let Some(grandparent) = parent.parent() {
            parent.virtual_loss.fetch_sub(1, Ordering::AcqRel);
            parent = grandparent;
        }
    }
}
