//! Calling-context trees local to one monitor.
//!
//! Every node gets a dense reference id the moment it is created. Events
//! carry these ids; after the monitor stops, the trace merges the tree into
//! its global one and hands back a table translating the ids.

use std::collections::BTreeMap;

/// Children of a node, keyed by instruction address.
pub type IpRefMap = BTreeMap<u64, IpRefEntry>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRefEntry {
    pub local_ref: u32,
    pub children: IpRefMap,
}

impl IpRefEntry {
    fn new(local_ref: u32) -> Self {
        IpRefEntry {
            local_ref,
            children: IpRefMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadCctxRefs {
    /// Process of the thread, `None` until a record told us.
    pub pid: Option<libc::pid_t>,
    pub entry: IpRefEntry,
}

#[derive(Debug, Default, Clone)]
pub struct LocalCctxTree {
    threads: BTreeMap<libc::pid_t, ThreadCctxRefs>,
    next_ref: u32,
}

impl LocalCctxTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u32 {
        let local_ref = self.next_ref;
        self.next_ref += 1;
        local_ref
    }

    /// Root reference of `tid`, which stands for the thread itself.
    pub fn thread_ref(&mut self, pid: Option<libc::pid_t>, tid: libc::pid_t) -> u32 {
        if !self.threads.contains_key(&tid) {
            let local_ref = self.allocate();
            self.threads.insert(
                tid,
                ThreadCctxRefs {
                    pid,
                    entry: IpRefEntry::new(local_ref),
                },
            );
        }
        let Some(thread) = self.threads.get_mut(&tid) else {
            unreachable!("thread inserted above");
        };
        if thread.pid.is_none() {
            thread.pid = pid;
        }
        thread.entry.local_ref
    }

    /// Walks (and extends) the path `ips` below the thread root, outermost
    /// frame first, returning the reference of the innermost frame.
    pub fn sample_ref<I>(&mut self, pid: libc::pid_t, tid: libc::pid_t, ips: I) -> u32
    where
        I: IntoIterator<Item = u64>,
    {
        self.thread_ref(Some(pid), tid);
        let mut next_ref = self.next_ref;
        let Some(thread) = self.threads.get_mut(&tid) else {
            unreachable!("thread inserted above");
        };
        let mut node = &mut thread.entry;
        for ip in ips {
            node = node.children.entry(ip).or_insert_with(|| {
                let entry = IpRefEntry::new(next_ref);
                next_ref += 1;
                entry
            });
        }
        let leaf = node.local_ref;
        self.next_ref = next_ref;
        leaf
    }

    /// Number of references handed out so far.
    pub fn num_refs(&self) -> usize {
        self.next_ref as usize
    }

    pub fn threads(&self) -> impl Iterator<Item = (libc::pid_t, &ThreadCctxRefs)> {
        self.threads.iter().map(|(tid, refs)| (*tid, refs))
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refs_are_dense_and_stable() {
        let mut tree = LocalCctxTree::new();
        let root = tree.thread_ref(Some(10), 11);
        let a = tree.sample_ref(10, 11, [0x100]);
        let b = tree.sample_ref(10, 11, [0x100, 0x200]);
        let a_again = tree.sample_ref(10, 11, [0x100]);
        let other_root = tree.thread_ref(None, 12);

        assert_eq!((root, a, b, other_root), (0, 1, 2, 3));
        assert_eq!(a, a_again);
        assert_eq!(tree.num_refs(), 4);
    }

    #[test]
    fn test_thread_pid_learned_later() {
        let mut tree = LocalCctxTree::new();
        tree.thread_ref(None, 5);
        assert_eq!(tree.threads().next().unwrap().1.pid, None);
        tree.sample_ref(4, 5, [0x1]);
        assert_eq!(tree.threads().next().unwrap().1.pid, Some(4));
    }

    #[test]
    fn test_empty_callchain_returns_thread_root() {
        let mut tree = LocalCctxTree::new();
        let root = tree.thread_ref(Some(1), 1);
        assert_eq!(tree.sample_ref(1, 1, std::iter::empty()), root);
    }
}
