//! A record of every typing action taken during resolution, and of where the type came from.

use crate::containers::InsertionOrderedSet;
use crate::types::Type;

/// Something that received (or provided) a type
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    /// A parameter or local of a function
    Variable { function: String, variable: String },
    Global { address: u64, name: Option<String> },
    /// A struct member read through a typed pointer
    Field { struct_name: String, member: String },
    /// A protocol dispatch call site
    CallSite { function: String, address: u64 },
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Location::Variable { function, variable } => write!(f, "{}::{}", function, variable),
            Location::Global {
                address,
                name: Some(name),
            } => write!(f, "{} @ {:#x}", name, address),
            Location::Global {
                address,
                name: None,
            } => write!(f, "data_{:x}", address),
            Location::Field {
                struct_name,
                member,
            } => write!(f, "{}.{}", struct_name, member),
            Location::CallSite { function, address } => {
                write!(f, "call in {} @ {:#x}", function, address)
            }
        }
    }
}

/// A single typing action
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEvent {
    /// Where the type flowed from; `None` for seeds
    pub from: Option<Location>,
    pub to: Location,
    pub ty: Type,
    pub cause: &'static str,
}

#[derive(Default, Debug)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record(&mut self, from: Option<Location>, to: Location, ty: &Type, cause: &'static str) {
        self.events.push(TraceEvent {
            from,
            to,
            ty: ty.clone(),
            cause,
        });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Write the flow of types as a GraphViz `.dot` graph
    pub fn write_dot<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        type Node = usize;
        type Edge = (usize, usize, String);

        struct Graph {
            nodes: Vec<(Location, Option<Type>)>,
            edges: Vec<Edge>,
        }

        let mut interned: InsertionOrderedSet<Location> = InsertionOrderedSet::new();
        let mut edges: Vec<Edge> = vec![];
        let mut received: Vec<(usize, Type)> = vec![];
        for ev in &self.events {
            let to = interned.insert(ev.to.clone());
            received.push((to, ev.ty.clone()));
            if let Some(from) = &ev.from {
                let from = interned.insert(from.clone());
                edges.push((from, to, ev.cause.to_owned()));
            }
        }
        let mut nodes: Vec<(Location, Option<Type>)> =
            interned.into_vec().into_iter().map(|l| (l, None)).collect();
        for (n, ty) in received {
            nodes[n].1 = Some(ty);
        }
        let g = Graph { nodes, edges };

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("TypePropagation").unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(format!("n{}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                let (loc, ty) = &self.nodes[*n];
                dot::LabelText::label(match ty {
                    Some(ty) => format!("{}\n{}", loc, ty),
                    None => format!("{}", loc),
                })
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                match &self.nodes[*n].0 {
                    Location::Global { .. } => Some(dot::LabelText::label("box")),
                    Location::CallSite { .. } => Some(dot::LabelText::label("note")),
                    Location::Variable { .. } | Location::Field { .. } => None,
                }
            }
            fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
                dot::LabelText::label(e.2.clone())
            }
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                (0..self.nodes.len()).collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.edges.clone().into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&g, w)
    }

    /// Generate a `.dot` file representing the flow of types
    pub fn generate_dot(&self) -> String {
        let mut s: Vec<u8> = vec![];
        // Writing into a `Vec` cannot fail
        let _ = self.write_dot(&mut s);
        String::from_utf8_lossy(&s).into_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dot_output_interns_locations() {
        let mut t = Trace::new();
        let st = Location::Variable {
            function: "ModuleEntryPoint".into(),
            variable: "SystemTable".into(),
        };
        let ty = Type::named("EFI_SYSTEM_TABLE").pointer();
        t.record(None, st.clone(), &ty, "entry point");
        t.record(
            Some(st),
            Location::Variable {
                function: "Helper".into(),
                variable: "SystemTable".into(),
            },
            &ty,
            "call argument",
        );
        let dot = t.generate_dot();
        assert!(dot.starts_with("digraph TypePropagation {"));
        assert!(dot.contains("n0 -> n1"));
        assert!(dot.contains("call argument"));
        assert_eq!(t.events().len(), 2);
    }
}
