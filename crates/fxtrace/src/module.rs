//! Addressable module hierarchies and the tracer that attributes nodes to module paths.
//!
//! A module instance may be reachable through several routes (a diamond). Every access through
//! [`AccessPathView::get`] on a tracked view records the route it took; the most recent route wins
//! and is what nodes created inside the module report in their `module_stack`.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

use crate::dispatch::Dispatcher;
use crate::error::{TraceError, TraceResult};
use crate::ir::ModuleFrame;
use crate::tracer::Tracer;
use crate::value::{TensorRef, Value};

pub type ForwardFn = Rc<dyn Fn(&Dispatcher<'_>, &AccessPathView, &[Value]) -> TraceResult<Value>>;

pub struct Module {
    type_name: String,
    children: Vec<(String, Rc<Module>)>,
    parameters: Vec<(String, TensorRef)>,
    forward: ForwardFn,
}

impl Module {
    pub fn builder(type_name: &str) -> ModuleBuilder {
        ModuleBuilder {
            type_name: type_name.to_string(),
            children: Vec::new(),
            parameters: Vec::new(),
            forward: None,
            error: None,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn child(&self, name: &str) -> Option<&Rc<Module>> {
        self.children
            .iter()
            .find(|(child, _)| child == name)
            .map(|(_, module)| module)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Rc<Module>)> {
        self.children.iter().map(|(name, module)| (name.as_str(), module))
    }

    pub fn parameter(&self, name: &str) -> Option<&TensorRef> {
        self.parameters
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, tensor)| tensor)
    }

    pub fn parameters(&self) -> impl Iterator<Item = (&str, &TensorRef)> {
        self.parameters.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn forward(
        &self,
        d: &Dispatcher<'_>,
        view: &AccessPathView,
        args: &[Value],
    ) -> TraceResult<Value> {
        (self.forward)(d, view, args)
    }

    /// Every distinct module below (and including) `root` with the first path that reaches it,
    /// in breadth-first order.
    pub fn named_modules(root: &Rc<Module>) -> Vec<(String, Rc<Module>)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::from([(String::new(), Rc::clone(root))]);
        while let Some((path, module)) = queue.pop_front() {
            if !seen.insert(Rc::as_ptr(&module)) {
                continue;
            }
            for (name, child) in &module.children {
                queue.push_back((join_path(&path, name), Rc::clone(child)));
            }
            out.push((path, module));
        }
        out
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("type_name", &self.type_name)
            .field("children", &self.children.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("parameters", &self.parameters.len())
            .finish()
    }
}

pub struct ModuleBuilder {
    type_name: String,
    children: Vec<(String, Rc<Module>)>,
    parameters: Vec<(String, TensorRef)>,
    forward: Option<ForwardFn>,
    error: Option<TraceError>,
}

impl ModuleBuilder {
    pub fn child(mut self, name: &str, module: Rc<Module>) -> Self {
        if self.check_name("submodule", name) {
            self.children.push((name.to_string(), module));
        }
        self
    }

    pub fn parameter(mut self, name: &str, tensor: TensorRef) -> Self {
        if self.check_name("parameter", name) {
            self.parameters.push((name.to_string(), tensor));
        }
        self
    }

    pub fn forward<F>(mut self, f: F) -> Self
    where
        F: Fn(&Dispatcher<'_>, &AccessPathView, &[Value]) -> TraceResult<Value> + 'static,
    {
        self.forward = Some(Rc::new(f));
        self
    }

    /// Fails with the first invalid name given to the builder.
    pub fn build(self) -> TraceResult<Rc<Module>> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let type_name = self.type_name;
        let forward = match self.forward {
            Some(forward) => forward,
            None => missing_forward(type_name.clone()),
        };
        Ok(Rc::new(Module {
            type_name,
            children: self.children,
            parameters: self.parameters,
            forward,
        }))
    }

    fn check_name(&mut self, what: &str, name: &str) -> bool {
        let problem = if name.is_empty() {
            Some(format!("{what} names must be non-empty"))
        } else if name.contains('.') {
            Some(format!("{what} names must not contain '.', got '{name}'"))
        } else if !name.is_ascii() {
            Some(format!("{what} names must be ASCII, got '{name}'"))
        } else if self.children.iter().any(|(n, _)| n == name)
            || self.parameters.iter().any(|(n, _)| n == name)
        {
            Some(format!("duplicate {what} name '{name}' on `{}`", self.type_name))
        } else {
            None
        };
        match problem {
            Some(message) => {
                self.error.get_or_insert(TraceError::Config(message));
                false
            }
            None => true,
        }
    }
}

fn missing_forward(type_name: String) -> ForwardFn {
    Rc::new(move |_: &Dispatcher<'_>, _: &AccessPathView, _: &[Value]| {
        Err(TraceError::Config(format!("module `{type_name}` has no forward function")))
    })
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

/// Handle to a module that remembers the route it was reached through.
#[derive(Clone)]
pub struct AccessPathView {
    module: Rc<Module>,
    path: Option<Rc<RefCell<String>>>,
    tracker: Option<Weak<ModuleStackTracer>>,
}

impl AccessPathView {
    /// View with no recorded route. Submodules reached from it are untracked as well.
    pub fn detached(module: Rc<Module>) -> Self {
        AccessPathView {
            module,
            path: None,
            tracker: None,
        }
    }

    pub fn module(&self) -> &Rc<Module> {
        &self.module
    }

    /// Route recorded for this module, if the view is tracked.
    pub fn path(&self) -> Option<String> {
        self.path.as_ref().map(|path| path.borrow().clone())
    }

    pub fn parameter(&self, name: &str) -> TraceResult<TensorRef> {
        self.module
            .parameter(name)
            .cloned()
            .ok_or_else(|| {
                let found = format!("{}.{name}", self.module.type_name);
                TraceError::unexpected("registered parameter", found)
            })
    }

    /// View of submodule `name`. On a tracked view this overwrites the submodule's recorded route.
    pub fn get(&self, name: &str) -> TraceResult<AccessPathView> {
        let child = self
            .module
            .child(name)
            .cloned()
            .ok_or_else(|| {
                let found = format!("{}.{name}", self.module.type_name);
                TraceError::unexpected("registered submodule", found)
            })?;
        let tracker = self.tracker.as_ref().and_then(Weak::upgrade);
        let (Some(tracker), Some(parent_path)) = (tracker, self.path()) else {
            return Ok(AccessPathView::detached(child));
        };
        let path = tracker.record_route(&child, join_path(&parent_path, name));
        Ok(AccessPathView {
            module: child,
            path: Some(path),
            tracker: self.tracker.clone(),
        })
    }

    fn tracked_by(&self, tracer: &ModuleStackTracer) -> bool {
        self.tracker
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), tracer))
    }
}

impl std::fmt::Debug for AccessPathView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPathView")
            .field("type_name", &self.module.type_name)
            .field("path", &self.path())
            .finish()
    }
}

/// Resolves a path per module instance and pushes module frames while modules run.
pub struct ModuleStackTracer {
    this: Weak<ModuleStackTracer>,
    scope_root: Rc<Module>,
    tracer: Rc<Tracer>,
    routes: RefCell<HashMap<*const Module, (Rc<Module>, Rc<RefCell<String>>)>>,
}

impl ModuleStackTracer {
    pub fn new(scope_root: Rc<Module>, tracer: Rc<Tracer>) -> Rc<Self> {
        Rc::new_cyclic(|this| ModuleStackTracer {
            this: this.clone(),
            scope_root,
            tracer,
            routes: RefCell::new(HashMap::new()),
        })
    }

    pub fn scope_root(&self) -> &Rc<Module> {
        &self.scope_root
    }

    pub fn root_view(&self) -> AccessPathView {
        AccessPathView {
            module: Rc::clone(&self.scope_root),
            path: Some(Rc::new(RefCell::new(String::new()))),
            tracker: Some(self.this.clone()),
        }
    }

    /// Shared route cell for `module`, set to `path`.
    fn record_route(&self, module: &Rc<Module>, path: String) -> Rc<RefCell<String>> {
        let mut routes = self.routes.borrow_mut();
        let (_, cell) = routes
            .entry(Rc::as_ptr(module))
            .or_insert_with(|| (Rc::clone(module), Rc::new(RefCell::new(String::new()))));
        *cell.borrow_mut() = path;
        Rc::clone(cell)
    }

    /// Canonical path of the module behind `view`: "" for the root, the recorded route for
    /// tracked views, else the first breadth-first path from the root.
    pub fn path_of_module(&self, view: &AccessPathView) -> TraceResult<String> {
        let module = view.module();
        if Rc::ptr_eq(module, &self.scope_root) {
            return Ok(String::new());
        }
        if view.tracked_by(self) {
            if let Some(path) = view.path() {
                return Ok(path);
            }
        }
        if let Some((_, cell)) = self.routes.borrow().get(&Rc::as_ptr(module)) {
            return Ok(cell.borrow().clone());
        }
        Module::named_modules(&self.scope_root)
            .into_iter()
            .find(|(_, candidate)| Rc::ptr_eq(candidate, module))
            .map(|(path, _)| path)
            .ok_or_else(|| TraceError::PathResolution {
                type_name: module.type_name().to_string(),
            })
    }

    /// Runs the module's forward function inside a module frame. A module that cannot be
    /// located under the root still runs, just without a frame.
    pub fn call_module(
        &self,
        d: &Dispatcher<'_>,
        view: &AccessPathView,
        args: &[Value],
    ) -> TraceResult<Value> {
        let module = view.module();
        match self.path_of_module(view) {
            Ok(path) => {
                let _frame = self.tracer.enter_module(ModuleFrame {
                    path,
                    type_name: module.type_name().to_string(),
                });
                module.forward(d, view, args)
            }
            Err(err) => {
                tracing::warn!(
                    module = module.type_name(),
                    error = %err,
                    "module is not a submodule of the traced root; running it without a frame"
                );
                module.forward(d, view, args)
            }
        }
    }
}

impl std::fmt::Debug for ModuleStackTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStackTracer")
            .field("scope_root", &self.scope_root.type_name)
            .field("routes", &self.routes.borrow().len())
            .finish()
    }
}
