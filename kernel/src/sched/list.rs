//! Doubly-linked list of task ids
//!
//! Links are stored in a table indexed by task id, so every operation that
//! is given an id is O(1). The list never owns tasks; the scheduler's task
//! table does. A task id can be in at most one position of a given list.

use alloc::vec::Vec;

use super::task::TaskId;

#[derive(Debug, Clone, Copy, Default)]
struct Link {
    prev: Option<TaskId>,
    next: Option<TaskId>,
}

#[derive(Debug, Default)]
pub struct TaskList {
    head: Option<TaskId>,
    tail: Option<TaskId>,
    links: Vec<Option<Link>>,
    len: usize,
}

impl TaskList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            links: Vec::new(),
            len: 0,
        }
    }

    pub fn head(&self) -> Option<TaskId> {
        self.head
    }

    pub fn tail(&self) -> Option<TaskId> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.link(id).is_some()
    }

    /// Successor of `id`, or `None` at the tail or when `id` is not linked
    pub fn next(&self, id: TaskId) -> Option<TaskId> {
        self.link(id).and_then(|link| link.next)
    }

    pub fn prev(&self, id: TaskId) -> Option<TaskId> {
        self.link(id).and_then(|link| link.prev)
    }

    /// Link `id` at the tail. Returns false if it is already linked.
    pub fn append(&mut self, id: TaskId) -> bool {
        if self.contains(id) {
            return false;
        }
        let link = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => self.link_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.store(id, link);
        true
    }

    /// Link `id` in front of `before`
    ///
    /// `before == None` appends at the tail, or makes `id` the only element
    /// of an empty list. Returns false if `id` is already linked or
    /// `before` is not.
    pub fn insert_before(&mut self, id: TaskId, before: Option<TaskId>) -> bool {
        let Some(before) = before else {
            return self.append(id);
        };
        if self.contains(id) || !self.contains(before) {
            return false;
        }
        let prev = self.link_mut(before).prev;
        self.link_mut(before).prev = Some(id);
        match prev {
            Some(prev) => self.link_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }
        self.store(
            id,
            Link {
                prev,
                next: Some(before),
            },
        );
        true
    }

    /// Link `id` right behind `after`
    pub fn insert_after(&mut self, id: TaskId, after: TaskId) -> bool {
        if self.contains(id) || !self.contains(after) {
            return false;
        }
        let next = self.link_mut(after).next;
        self.link_mut(after).next = Some(id);
        match next {
            Some(next) => self.link_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.store(
            id,
            Link {
                prev: Some(after),
                next,
            },
        );
        true
    }

    /// Unlink `id`, clearing its links. Returns false if it was not linked.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let Some(link) = self.links.get_mut(id).and_then(Option::take) else {
            return false;
        };
        match link.prev {
            Some(prev) => self.link_mut(prev).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => self.link_mut(next).prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
        true
    }

    /// Ids from head to tail
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    fn link(&self, id: TaskId) -> Option<&Link> {
        self.links.get(id).and_then(Option::as_ref)
    }

    // Callers only pass ids they have checked are linked
    fn link_mut(&mut self, id: TaskId) -> &mut Link {
        self.links[id].get_or_insert_with(Link::default)
    }

    fn store(&mut self, id: TaskId, link: Link) {
        if self.links.len() <= id {
            self.links.resize(id + 1, None);
        }
        self.links[id] = Some(link);
        self.len += 1;
    }
}

pub struct Iter<'a> {
    list: &'a TaskList,
    cursor: Option<TaskId>,
}

impl Iterator for Iter<'_> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let id = self.cursor?;
        self.cursor = self.list.next(id);
        Some(id)
    }
}
