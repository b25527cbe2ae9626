//! RAII guards over the dispatch context's slots, stacks, and flags.
//!
//! Every guard restores the state it displaced when dropped, so early returns through `?` and
//! unwinding panics leave the context exactly as they found it.

use std::cell::{Cell, RefCell};

/// Restores the previous content of a slot when dropped.
#[must_use = "the previous value is restored as soon as the guard is dropped"]
pub struct SlotGuard<'a, T> {
    cell: &'a RefCell<T>,
    previous: Option<T>,
}

impl<'a, T> SlotGuard<'a, T> {
    pub(crate) fn replace(cell: &'a RefCell<T>, value: T) -> Self {
        let previous = cell.replace(value);
        SlotGuard {
            cell,
            previous: Some(previous),
        }
    }

    /// Value the slot held before the guard was taken.
    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.cell.replace(previous);
        }
    }
}

/// Pops the entry pushed onto a layer stack when dropped.
#[must_use = "the layer is popped as soon as the guard is dropped"]
pub struct StackGuard<'a, T> {
    stack: &'a RefCell<Vec<T>>,
    active: bool,
}

impl<'a, T> StackGuard<'a, T> {
    pub(crate) fn push(stack: &'a RefCell<Vec<T>>, item: T) -> Self {
        stack.borrow_mut().push(item);
        StackGuard { stack, active: true }
    }
}

impl<T> Drop for StackGuard<'_, T> {
    fn drop(&mut self) {
        if self.active {
            self.stack.borrow_mut().pop();
            self.active = false;
        }
    }
}

/// Pushes back the entry taken off the top of a layer stack when dropped.
#[must_use = "the layer is reinstated as soon as the guard is dropped"]
pub struct SuspendGuard<'a, T> {
    stack: &'a RefCell<Vec<T>>,
    item: Option<T>,
}

impl<'a, T: Clone> SuspendGuard<'a, T> {
    /// Takes the top entry off `stack`, returning it together with the guard that reinstates it.
    pub(crate) fn take_top(stack: &'a RefCell<Vec<T>>) -> Option<(T, Self)> {
        let item = stack.borrow_mut().pop()?;
        Some((
            item.clone(),
            SuspendGuard {
                stack,
                item: Some(item),
            },
        ))
    }
}

impl<T> Drop for SuspendGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.stack.borrow_mut().push(item);
        }
    }
}

/// Restores a flag or counter when dropped.
#[must_use = "the flag is restored as soon as the guard is dropped"]
pub struct FlagGuard<'a, T: Copy> {
    cell: &'a Cell<T>,
    previous: T,
}

impl<'a, T: Copy> FlagGuard<'a, T> {
    pub(crate) fn set(cell: &'a Cell<T>, value: T) -> Self {
        let previous = cell.replace(value);
        FlagGuard { cell, previous }
    }
}

impl<T: Copy> Drop for FlagGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.set(self.previous);
    }
}
