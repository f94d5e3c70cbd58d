//! Value heap and persistent handles
//!
//! This is the engine side of the embedding layer: values live in
//! index-stable cells, persistent handles owned by native code either root a
//! value (strong) or merely watch it (weak), and a tri-color mark and sweep
//! reclaims whatever no strong handle can reach. Weak handles whose target
//! was reclaimed are cleared and reported back in [`Collection`], which is how
//! the collector "calls" weak callbacks.

use crate::color::Color;
use crate::finalizer::Opaque;
use crate::trace::{Trace, Tracer};
use crate::tracker::RefId;
use std::collections::HashMap;

/// A value in the heap
///
/// Like an engine's local handle it does not keep the value alive; only a
/// strong [`Persistent`] does. Once the cell is reclaimed the value reads as
/// dead even if the slot gets reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value {
    index: u32,
    generation: u32,
}

/// Contents of a heap cell
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Symbol {
        description: Option<String>,
        /// Created through the global registry (`symbol_for`); never collected
        registered: bool,
    },
    Object(Object),
    External(Opaque),
}

/// A plain object: an ordered bag of fields plus an optional native wrap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    fields: Vec<Value>,
    wrap: Option<RefId>,
}

impl Object {
    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn wrap(&self) -> Option<RefId> {
        self.wrap
    }

    pub(crate) fn push_field(&mut self, value: Value) {
        self.fields.push(value);
    }

    pub(crate) fn set_wrap(&mut self, wrap: Option<RefId>) {
        self.wrap = wrap;
    }
}

impl Trace for Object {
    fn trace(&self, tracer: &mut Tracer) {
        self.fields.trace(tracer);
    }
}

impl Trace for ValueData {
    fn trace(&self, tracer: &mut Tracer) {
        if let ValueData::Object(object) = self {
            object.trace(tracer);
        }
    }
}

impl ValueData {
    /// Objects, externals and unregistered symbols can be held weakly.
    /// Everything else is either immortal or a primitive the engine will not
    /// report through a weak callback.
    pub fn can_be_held_weakly(&self) -> bool {
        match self {
            ValueData::Object(_) | ValueData::External(_) => true,
            ValueData::Symbol { registered, .. } => !registered,
            _ => false,
        }
    }
}

struct Cell {
    generation: u32,
    color: Color,
    /// Number of strong persistents pointing here (0 = not a root)
    root_count: usize,
    immortal: bool,
    data: Option<ValueData>,
}

/// Native-owned handle to a heap value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Persistent {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleMode {
    Strong,
    /// Weak with the parameter handed back when the target is reclaimed
    Weak(RefId),
}

struct HandleSlot {
    generation: u32,
    in_use: bool,
    target: Option<Value>,
    mode: HandleMode,
}

/// Result of one collection cycle
#[derive(Debug, Default)]
pub struct Collection {
    /// Number of cells reclaimed
    pub reclaimed: usize,
    /// Parameters of the weak handles whose target was reclaimed, one per
    /// handle. The handles are already cleared.
    pub weak_callbacks: Vec<RefId>,
}

/// The value heap
pub struct Heap {
    cells: Vec<Cell>,
    free_cells: Vec<u32>,
    handles: Vec<HandleSlot>,
    free_handles: Vec<u32>,
    /// Gray cells waiting to be scanned
    gray_queue: Vec<Value>,
    symbol_registry: HashMap<String, Value>,
    undefined: Value,
    null: Value,
    true_value: Value,
    false_value: Value,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        let placeholder = Value {
            index: 0,
            generation: 0,
        };
        let mut heap = Self {
            cells: Vec::new(),
            free_cells: Vec::new(),
            handles: Vec::new(),
            free_handles: Vec::new(),
            gray_queue: Vec::new(),
            symbol_registry: HashMap::new(),
            undefined: placeholder,
            null: placeholder,
            true_value: placeholder,
            false_value: placeholder,
        };
        heap.undefined = heap.allocate_immortal(ValueData::Undefined);
        heap.null = heap.allocate_immortal(ValueData::Null);
        heap.true_value = heap.allocate_immortal(ValueData::Boolean(true));
        heap.false_value = heap.allocate_immortal(ValueData::Boolean(false));
        heap
    }

    pub fn undefined(&self) -> Value {
        self.undefined
    }

    pub fn null(&self) -> Value {
        self.null
    }

    pub fn boolean(&self, value: bool) -> Value {
        if value { self.true_value } else { self.false_value }
    }

    /// Allocate a new cell. It stays alive until the next collection unless
    /// something roots it.
    pub fn allocate(&mut self, data: ValueData) -> Value {
        if let Some(index) = self.free_cells.pop() {
            let cell = &mut self.cells[index as usize];
            cell.color = Color::White;
            cell.root_count = 0;
            cell.immortal = false;
            cell.data = Some(data);
            return Value {
                index,
                generation: cell.generation,
            };
        }

        let index = self.cells.len() as u32;
        self.cells.push(Cell {
            generation: 0,
            color: Color::White,
            root_count: 0,
            immortal: false,
            data: Some(data),
        });
        Value {
            index,
            generation: 0,
        }
    }

    fn allocate_immortal(&mut self, data: ValueData) -> Value {
        let value = self.allocate(data);
        self.cells[value.index as usize].immortal = true;
        value
    }

    /// Registered symbol for `key`, created on first use
    pub fn symbol_for(&mut self, key: &str) -> Value {
        if let Some(&symbol) = self.symbol_registry.get(key) {
            return symbol;
        }
        let symbol = self.allocate_immortal(ValueData::Symbol {
            description: Some(key.to_owned()),
            registered: true,
        });
        self.symbol_registry.insert(key.to_owned(), symbol);
        symbol
    }

    fn cell(&self, value: Value) -> Option<&Cell> {
        self.cells
            .get(value.index as usize)
            .filter(|cell| cell.generation == value.generation && cell.data.is_some())
    }

    fn cell_mut(&mut self, value: Value) -> Option<&mut Cell> {
        self.cells
            .get_mut(value.index as usize)
            .filter(|cell| cell.generation == value.generation && cell.data.is_some())
    }

    pub fn is_live(&self, value: Value) -> bool {
        self.cell(value).is_some()
    }

    pub fn data(&self, value: Value) -> Option<&ValueData> {
        self.cell(value)?.data.as_ref()
    }

    pub fn object(&self, value: Value) -> Option<&Object> {
        match self.data(value)? {
            ValueData::Object(object) => Some(object),
            _ => None,
        }
    }

    pub(crate) fn object_mut(&mut self, value: Value) -> Option<&mut Object> {
        match self.cell_mut(value)?.data.as_mut()? {
            ValueData::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn can_be_held_weakly(&self, value: Value) -> bool {
        self.data(value)
            .is_some_and(ValueData::can_be_held_weakly)
    }

    /// Whether any strong persistent currently roots `value`
    pub fn is_rooted(&self, value: Value) -> bool {
        self.cell(value)
            .is_some_and(|cell| cell.immortal || cell.root_count > 0)
    }

    fn inc_root(&mut self, value: Value) {
        if let Some(cell) = self.cell_mut(value) {
            cell.root_count += 1;
        }
    }

    fn dec_root(&mut self, value: Value) {
        if let Some(cell) = self.cell_mut(value) {
            debug_assert!(cell.root_count > 0, "root count underflow");
            cell.root_count = cell.root_count.saturating_sub(1);
        }
    }

    fn handle(&self, handle: Persistent) -> Option<&HandleSlot> {
        self.handles
            .get(handle.index as usize)
            .filter(|slot| slot.in_use && slot.generation == handle.generation)
    }

    fn handle_mut(&mut self, handle: Persistent) -> Option<&mut HandleSlot> {
        self.handles
            .get_mut(handle.index as usize)
            .filter(|slot| slot.in_use && slot.generation == handle.generation)
    }

    /// Create a strong handle rooting `value`
    pub fn new_persistent(&mut self, value: Value) -> Persistent {
        self.inc_root(value);
        let slot = HandleSlot {
            generation: 0,
            in_use: true,
            target: Some(value),
            mode: HandleMode::Strong,
        };

        if let Some(index) = self.free_handles.pop() {
            let existing = &mut self.handles[index as usize];
            let generation = existing.generation;
            *existing = HandleSlot { generation, ..slot };
            return Persistent { index, generation };
        }

        let index = self.handles.len() as u32;
        self.handles.push(slot);
        Persistent {
            index,
            generation: 0,
        }
    }

    /// Downgrade to a weak handle. When the target is reclaimed the handle is
    /// cleared and `parameter` is reported in [`Collection::weak_callbacks`].
    pub fn make_weak(&mut self, handle: Persistent, parameter: RefId) {
        let Some(slot) = self.handle_mut(handle) else {
            return;
        };
        let was_strong = slot.mode == HandleMode::Strong;
        slot.mode = HandleMode::Weak(parameter);
        let target = slot.target;
        if was_strong && let Some(target) = target {
            self.dec_root(target);
        }
    }

    /// Upgrade back to a strong handle, cancelling the weak registration.
    /// Returns the re-rooted value, or `None` if it was already reclaimed.
    pub fn clear_weak(&mut self, handle: Persistent) -> Option<Value> {
        let slot = self.handle_mut(handle)?;
        let was_weak = matches!(slot.mode, HandleMode::Weak(_));
        slot.mode = HandleMode::Strong;
        let target = slot.target?;
        if was_weak {
            self.inc_root(target);
        }
        Some(target)
    }

    /// Release the handle. No weak callback will be reported for it.
    pub fn reset(&mut self, handle: Persistent) {
        let Some(slot) = self.handle_mut(handle) else {
            return;
        };
        let rooted = slot.mode == HandleMode::Strong;
        let target = slot.target.take();
        slot.in_use = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_handles.push(handle.index);
        if rooted && let Some(target) = target {
            self.dec_root(target);
        }
    }

    /// Current target of the handle, `None` once reclaimed or reset
    pub fn get(&self, handle: Persistent) -> Option<Value> {
        self.handle(handle)?.target
    }

    pub fn is_weak(&self, handle: Persistent) -> bool {
        self.handle(handle)
            .is_some_and(|slot| matches!(slot.mode, HandleMode::Weak(_)))
    }

    /// Run a full mark and sweep.
    pub fn collect(&mut self) -> Collection {
        self.mark();
        let reclaimed = self.sweep();
        let weak_callbacks = self.clear_dead_weak_handles();
        tracing::debug!(
            reclaimed,
            weak_callbacks = weak_callbacks.len(),
            live = self.allocation_count(),
            "heap collection finished"
        );
        Collection {
            reclaimed,
            weak_callbacks,
        }
    }

    fn do_mark_roots(&mut self) {
        for (index, cell) in self.cells.iter_mut().enumerate() {
            if cell.data.is_some() && (cell.immortal || cell.root_count > 0) && cell.color.mark_white_to_gray() {
                self.gray_queue.push(Value {
                    index: index as u32,
                    generation: cell.generation,
                });
            }
        }
    }

    fn do_mark_work_full(&mut self, tracer: &mut Tracer) {
        while let Some(value) = self.gray_queue.pop() {
            if let Some(data) = self.cell(value).and_then(|cell| cell.data.as_ref()) {
                data.trace(tracer);
            }

            if tracer.has_work() {
                for edge in tracer.take_edges() {
                    if let Some(cell) = self.cell_mut(edge)
                        && cell.color.mark_white_to_gray()
                    {
                        self.gray_queue.push(edge);
                    }
                }
            }

            if let Some(cell) = self.cell_mut(value) {
                cell.color.mark_black();
            }
        }
    }

    fn mark(&mut self) {
        let mut tracer = Tracer::new();
        self.do_mark_roots();
        self.do_mark_work_full(&mut tracer);
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (index, cell) in self.cells.iter_mut().enumerate() {
            if cell.data.is_none() {
                continue;
            }
            if cell.color.is_white() && !cell.immortal {
                cell.data = None;
                cell.root_count = 0;
                cell.generation = cell.generation.wrapping_add(1);
                self.free_cells.push(index as u32);
                freed += 1;
            } else {
                // Reset color for next cycle
                cell.color.reset_white();
            }
        }
        freed
    }

    fn clear_dead_weak_handles(&mut self) -> Vec<RefId> {
        let mut fired = Vec::new();
        for index in 0..self.handles.len() {
            let slot = &self.handles[index];
            let (true, Some(target), HandleMode::Weak(parameter)) = (slot.in_use, slot.target, slot.mode) else {
                continue;
            };
            if self.is_live(target) {
                continue;
            }
            self.handles[index].target = None;
            fired.push(parameter);
        }
        fired
    }

    /// Number of live cells, immortal ones included
    pub fn allocation_count(&self) -> usize {
        self.cells.iter().filter(|cell| cell.data.is_some()).count()
    }

    /// Number of persistent handles in use
    pub fn handle_count(&self) -> usize {
        self.handles.iter().filter(|slot| slot.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(heap: &mut Heap) -> Value {
        heap.allocate(ValueData::Object(Object::default()))
    }

    fn weak_parameter(n: u64) -> RefId {
        RefId::from_raw(n)
    }

    #[test]
    fn unrooted_values_are_reclaimed() {
        let mut heap = Heap::new();
        let baseline = heap.allocation_count();
        let value = heap.allocate(ValueData::Number(1.0));
        assert!(heap.is_live(value));
        let collection = heap.collect();
        assert_eq!(collection.reclaimed, 1);
        assert!(!heap.is_live(value));
        assert_eq!(heap.allocation_count(), baseline);
    }

    #[test]
    fn oddballs_and_registered_symbols_survive() {
        let mut heap = Heap::new();
        let symbol = heap.symbol_for("app.key");
        assert_eq!(heap.symbol_for("app.key"), symbol);
        heap.collect();
        assert!(heap.is_live(heap.undefined()));
        assert!(heap.is_live(heap.boolean(true)));
        assert!(heap.is_live(symbol));
        assert!(!heap.can_be_held_weakly(symbol));
        assert!(!heap.can_be_held_weakly(heap.null()));
    }

    #[test]
    fn strong_persistent_keeps_object_graph() {
        let mut heap = Heap::new();
        let parent = object(&mut heap);
        let child = heap.allocate(ValueData::String("child".into()));
        heap.object_mut(parent).expect("object").push_field(child);
        let handle = heap.new_persistent(parent);

        heap.collect();
        assert!(heap.is_live(parent));
        assert!(heap.is_live(child));

        heap.reset(handle);
        heap.collect();
        assert!(!heap.is_live(parent));
        assert!(!heap.is_live(child));
        assert_eq!(heap.handle_count(), 0);
    }

    #[test]
    fn weak_handle_reports_parameter_once() {
        let mut heap = Heap::new();
        let value = object(&mut heap);
        let handle = heap.new_persistent(value);
        heap.make_weak(handle, weak_parameter(3));
        assert!(heap.is_weak(handle));
        assert_eq!(heap.get(handle), Some(value));

        let first = heap.collect();
        assert_eq!(first.weak_callbacks, vec![weak_parameter(3)]);
        assert_eq!(heap.get(handle), None);

        let second = heap.collect();
        assert!(second.weak_callbacks.is_empty());
    }

    #[test]
    fn clear_weak_reroots_before_collection() {
        let mut heap = Heap::new();
        let value = object(&mut heap);
        let handle = heap.new_persistent(value);
        heap.make_weak(handle, weak_parameter(1));
        assert!(!heap.is_rooted(value));
        assert_eq!(heap.clear_weak(handle), Some(value));
        assert!(heap.is_rooted(value));

        let collection = heap.collect();
        assert!(collection.weak_callbacks.is_empty());
        assert!(heap.is_live(value));
    }

    #[test]
    fn reset_weak_handle_cancels_callback() {
        let mut heap = Heap::new();
        let value = object(&mut heap);
        let handle = heap.new_persistent(value);
        heap.make_weak(handle, weak_parameter(9));
        heap.reset(handle);
        let collection = heap.collect();
        assert!(collection.weak_callbacks.is_empty());
        assert!(!heap.is_live(value));
    }

    #[test]
    fn reused_cell_does_not_revive_stale_value() {
        let mut heap = Heap::new();
        let old = heap.allocate(ValueData::Number(1.0));
        heap.collect();
        let new = heap.allocate(ValueData::Number(2.0));
        assert!(!heap.is_live(old));
        assert!(heap.is_live(new));
        assert_eq!(heap.data(old), None);
    }
}
