use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ir::expr::{Function, GlobalVar};

/// A collection of named global functions, kept in insertion order.
#[derive(Clone, Default)]
pub struct IrModule {
    functions: Vec<(GlobalVar, Function)>,
    index: HashMap<GlobalVar, usize>,
}

impl IrModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a global function.
    pub fn add(&mut self, gv: GlobalVar, func: Function) {
        match self.index.get(&gv) {
            Some(&i) => self.functions[i].1 = func,
            None => {
                self.index.insert(gv.clone(), self.functions.len());
                self.functions.push((gv, func));
            }
        }
    }

    pub fn lookup(&self, gv: &GlobalVar) -> Result<&Function> {
        self.index
            .get(gv)
            .map(|&i| &self.functions[i].1)
            .ok_or_else(|| Error::UnknownGlobal {
                name: gv.name().to_string(),
            })
    }

    /// Look a global up by its name.
    pub fn get_global_var(&self, name: &str) -> Result<GlobalVar> {
        let gv = GlobalVar::new(name);
        if self.index.contains_key(&gv) {
            Ok(gv)
        } else {
            Err(Error::UnknownGlobal {
                name: name.to_string(),
            })
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = (&GlobalVar, &Function)> {
        self.functions.iter().map(|(g, f)| (g, f))
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for IrModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.functions.iter().map(|(g, _)| g))
            .finish()
    }
}
