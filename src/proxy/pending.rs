//! Coalescing of camera and scale changes between renders.
//!
//! Interactive clients send rotate/pan/zoom far faster than frames can be
//! produced. Handlers record the change here instead of talking to the
//! engine; [`PendingTransform::drain`] turns the net change into native
//! commands right before a capture.
//!
//! Rotations accumulate. Every other field keeps the last value given.

/// Not-yet-applied view changes. `None` means clean.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingTransform {
    viewport: Option<(u32, u32)>,
    rotation: Option<[f64; 3]>,
    pan: Option<(f64, f64)>,
    zoom: Option<f64>,
    atom_scale: Option<f64>,
    bond_thickness: Option<f64>,
}

impl PendingTransform {
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = Some((width, height));
    }

    /// Add a rotation (degrees about x, y and z).
    pub fn rotate(&mut self, x: f64, y: f64, z: f64) {
        let total = self.rotation.get_or_insert([0.0; 3]);
        total[0] += x;
        total[1] += y;
        total[2] += z;
    }

    pub fn set_pan(&mut self, x: f64, y: f64) {
        self.pan = Some((x, y));
    }

    pub fn set_zoom(&mut self, factor: f64) {
        self.zoom = Some(factor);
    }

    pub fn set_atom_scale(&mut self, scale: f64) {
        self.atom_scale = Some(scale);
    }

    pub fn set_bond_thickness(&mut self, thickness: f64) {
        self.bond_thickness = Some(thickness);
    }

    pub fn rotation(&self) -> Option<[f64; 3]> {
        self.rotation
    }

    pub fn pan(&self) -> Option<(f64, f64)> {
        self.pan
    }

    pub fn zoom(&self) -> Option<f64> {
        self.zoom
    }

    pub fn atom_scale(&self) -> Option<f64> {
        self.atom_scale
    }

    pub fn bond_thickness(&self) -> Option<f64> {
        self.bond_thickness
    }

    pub fn viewport(&self) -> Option<(u32, u32)> {
        self.viewport
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Take every pending change as native commands, in application order:
    /// viewport, rotation, pan, zoom, atom scale, bond thickness.
    ///
    /// A rotation whose components cancel out emits nothing.
    pub fn drain(&mut self) -> Vec<String> {
        let mut commands = Vec::new();

        if let Some((width, height)) = self.viewport.take() {
            commands.push(format!("viewport {},{}", width, height));
            commands.push("refresh".to_string());
        }
        if let Some([x, y, z]) = self.rotation.take() {
            if x != 0.0 || y != 0.0 || z != 0.0 {
                // One line so the engine redraws once
                commands.push(format!("turn x,{};turn y,{};turn z,{}", x, y, z));
            }
        }
        if let Some((x, y)) = self.pan.take() {
            commands.push(format!("move x,{}", x));
            commands.push(format!("move y,{}", y));
        }
        if let Some(factor) = self.zoom.take() {
            commands.push(format!("move z,{}", factor));
        }
        if let Some(scale) = self.atom_scale.take() {
            commands.push(format!("set sphere_scale,{},all", scale));
        }
        if let Some(thickness) = self.bond_thickness.take() {
            commands.push(format!("set stick_radius,{},all", thickness));
        }
        commands
    }
}
