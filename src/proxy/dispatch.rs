//! Verb lookup for client commands.

use std::collections::HashMap;

use super::command::Result;
use super::handlers;
use super::session::Session;

/// A client command implementation. Receives the words after the verb.
pub type Handler = fn(&mut Session, &[String]) -> Result<()>;

pub struct CommandTable {
    handlers: HashMap<&'static str, Handler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Table holding every command the proxy understands.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register("atomscale", handlers::atom_scale);
        table.register("spherescale", handlers::atom_scale);
        table.register("ballnstick", handlers::ball_and_stick);
        table.register("bmp", handlers::bmp);
        table.register("bondthickness", handlers::bond_thickness);
        table.register("stickradius", handlers::bond_thickness);
        table.register("cartoon", handlers::cartoon);
        table.register("cartoontrace", handlers::cartoon_trace);
        table.register("clientinfo", handlers::client_info);
        table.register("disable", handlers::disable);
        table.register("enable", handlers::enable);
        table.register("frame", handlers::frame);
        table.register("label", handlers::label);
        table.register("lines", handlers::lines);
        table.register("loadpdb", handlers::load_pdb);
        table.register("orthoscopic", handlers::orthoscopic);
        table.register("pan", handlers::pan);
        table.register("png", handlers::png);
        table.register("ppm", handlers::ppm);
        table.register("print", handlers::print);
        table.register("raw", handlers::raw);
        table.register("representation", handlers::representation);
        table.register("reset", handlers::reset);
        table.register("rock", handlers::rock);
        table.register("rotate", handlers::rotate);
        table.register("screen", handlers::screen);
        table.register("viewport", handlers::screen);
        table.register("spheres", handlers::spheres);
        table.register("transparency", handlers::transparency);
        table.register("vmouse", handlers::vmouse);
        table.register("zoom", handlers::zoom);
        table
    }

    pub fn register(&mut self, verb: &'static str, handler: Handler) {
        self.handlers.insert(verb, handler);
    }

    pub fn lookup(&self, verb: &str) -> Option<Handler> {
        self.handlers.get(verb).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table() {
        let table = CommandTable::standard();

        for verb in [
            "atomscale", "ballnstick", "bmp", "bondthickness", "disable", "enable", "frame", "label",
            "lines", "loadpdb", "orthoscopic", "pan", "png", "raw", "reset", "rock", "rotate",
            "screen", "viewport", "spheres", "vmouse", "zoom", "cartoon", "cartoontrace",
            "transparency", "representation", "ppm", "print", "clientinfo", "spherescale",
            "stickradius",
        ] {
            assert!(table.lookup(verb).is_some(), "{}", verb);
        }
        assert_eq!(table.len(), 31);
        assert!(table.lookup("exec").is_none());
        assert!(table.lookup("ROTATE").is_none());
    }

    #[test]
    fn test_empty_table() {
        let table = CommandTable::new();
        assert!(table.is_empty());
        assert!(table.lookup("rotate").is_none());
    }
}
