pub mod compiler;
pub mod condition;

pub use compiler::{CompiledQuery, QueryCompiler};
pub use condition::{
    Condition, Connective, Direction, GroupKind, JoinSpec, Operator, OrderSpec, Query,
    SearchSpec,
};
