//! The module loader: turning compiled functions into runtime callables.
//!
//! Linking resolves every function's link table against the flat module map
//! and interns its constants — the once-per-load work a static constructor
//! would do. Instantiation wires upvalue cells; a pure function (no
//! upvalues) instantiates once and shares that instance.

use std::{cell::OnceCell, fmt, rc::Rc};

use crate::{
    emit::compiled::{CompiledFunction, CompiledModule, ConstValue},
    error::{LuaError, RunResult},
    intern::StrInterner,
    ir::FunctionId,
    value::{Callable, Cell, LuaValue},
};

/// A compiled function linked into its module: constants interned, nested
/// references resolved.
pub struct LinkedFunction {
    pub compiled: Rc<CompiledFunction>,
    /// Link table: targets of `MakeClosure`, index-aligned with the
    /// compiled function's `links`.
    pub links: Vec<Rc<LinkedFunction>>,
    /// Interned constant pool.
    pub consts: Vec<LuaValue>,
    /// The shared instance of a pure function.
    instance: OnceCell<Rc<LuaClosure>>,
}

impl LinkedFunction {
    /// Instantiates a callable with the given upvalue cells.
    ///
    /// Pure functions ignore fresh instantiation and return the singleton.
    #[must_use]
    pub fn instantiate(self: &Rc<Self>, upvals: Box<[Cell]>) -> Rc<LuaClosure> {
        if self.compiled.is_pure() {
            return self
                .instance
                .get_or_init(|| {
                    Rc::new(LuaClosure {
                        func: self.clone(),
                        upvals: Box::new([]),
                    })
                })
                .clone();
        }
        debug_assert_eq!(upvals.len(), self.compiled.upval_names.len());
        Rc::new(LuaClosure {
            func: self.clone(),
            upvals,
        })
    }
}

impl fmt::Debug for LinkedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedFunction")
            .field("class_name", &self.compiled.class_name)
            .field("links", &self.links.len())
            .finish_non_exhaustive()
    }
}

/// An instantiated Lua function: compiled code plus captured cells.
#[derive(Debug)]
pub struct LuaClosure {
    pub func: Rc<LinkedFunction>,
    pub upvals: Box<[Cell]>,
}

impl LuaClosure {
    /// Name used in tracebacks.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.func.compiled.class_name
    }

    #[must_use]
    pub fn upval(&self, index: usize) -> &Cell {
        &self.upvals[index]
    }
}

/// Links a whole module, returning the root's linked form.
///
/// # Errors
/// Fails when a link references a function the module does not contain —
/// a corrupt or mismatched artifact.
pub fn link_module(module: &CompiledModule, interner: &StrInterner) -> RunResult<Rc<LinkedFunction>> {
    let mut linked: ahash::AHashMap<FunctionId, Rc<LinkedFunction>> = ahash::AHashMap::new();
    link_function(module.main(), module, interner, &mut linked)
}

fn link_function(
    func: &CompiledFunction,
    module: &CompiledModule,
    interner: &StrInterner,
    linked: &mut ahash::AHashMap<FunctionId, Rc<LinkedFunction>>,
) -> RunResult<Rc<LinkedFunction>> {
    if let Some(existing) = linked.get(&func.id) {
        return Ok(existing.clone());
    }
    let mut links = Vec::with_capacity(func.links.len());
    for id in &func.links {
        let target = module
            .get(id)
            .ok_or_else(|| LuaError::illegal_op(format!("module is missing linked function {id}")))?;
        links.push(link_function(target, module, interner, linked)?);
    }
    let consts = func
        .consts
        .iter()
        .map(|c| match c {
            ConstValue::Bytes(bytes) => LuaValue::Str(interner.intern(bytes)),
        })
        .collect();
    let result = Rc::new(LinkedFunction {
        compiled: Rc::new(func.clone()),
        links,
        consts,
        instance: OnceCell::new(),
    });
    linked.insert(func.id.clone(), result.clone());
    Ok(result)
}

/// Instantiates the root function of a linked module with its `_ENV`.
///
/// The chunk's single loader-supplied upvalue is the globals cell.
#[must_use]
pub fn instantiate_main(main: &Rc<LinkedFunction>, env: LuaValue) -> Callable {
    let upvals: Box<[Cell]> = if main.compiled.upval_names.is_empty() {
        Box::new([])
    } else {
        // Slot 0 is `_ENV`; any further loader-supplied upvalues start nil.
        let mut cells = Vec::with_capacity(main.compiled.upval_names.len());
        cells.push(Cell::new(env));
        for _ in 1..main.compiled.upval_names.len() {
            cells.push(Cell::new(LuaValue::Nil));
        }
        cells.into_boxed_slice()
    };
    Callable::Closure(main.instantiate(upvals))
}
