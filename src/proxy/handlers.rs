//! Client command handlers.
//!
//! Each handler validates all of its arguments before touching session
//! state or the engine, so a malformed command has no effect. Camera and
//! global scale changes go to the pending transform; everything else is
//! sent to the engine right away.

use tracing::{debug, info};

use super::command::{
    parse_bool, parse_f64, parse_i32, split_list, Accepts, CommandError, Invocation, Result,
};
use super::frame::ImageFormat;
use super::session::Session;

fn on_off(value: bool) -> u8 {
    u8::from(value)
}

/// Target model: `-model name`, or a lone positional word, or `all`.
fn target<'a>(inv: &Invocation<'a>, usage: &'static str) -> Result<&'a str> {
    inv.arity(0, 1, usage)?;
    Ok(inv.model.or_else(|| inv.positional.first().copied()).unwrap_or("all"))
}

fn send_all(session: &mut Session, commands: &[String]) -> Result<()> {
    for command in commands {
        session.send(command)?;
    }
    Ok(())
}

pub fn rotate(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "rotate ?-defer? ?-push? xAngle ?yAngle? ?zAngle?";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(1, 3, USAGE)?;
    let mut angles = [0.0; 3];
    for (angle, word) in angles.iter_mut().zip(&inv.positional) {
        *angle = parse_f64(word)?;
    }

    session.pending_mut().rotate(angles[0], angles[1], angles[2]);
    session.mark_update(inv.update, true);
    Ok(())
}

/// Screen offsets are scaled and the y axis flipped.
pub fn pan(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "pan ?-defer? ?-push? x y";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(2, 2, USAGE)?;
    let x = parse_f64(inv.positional[0])?;
    let y = parse_f64(inv.positional[1])?;

    if x != 0.0 || y != 0.0 {
        let sensitivity = session.tuning().pan_sensitivity;
        let dy = if y == 0.0 { 0.0 } else { -y * sensitivity };
        session.pending_mut().set_pan(x * sensitivity, dy);
    }
    session.mark_update(inv.update, true);
    Ok(())
}

pub fn zoom(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "zoom ?-defer? ?-push? factor";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let factor = parse_f64(inv.positional[0])?;

    if factor != 0.0 {
        session.pending_mut().set_zoom(factor);
    }
    session.mark_update(inv.update, true);
    Ok(())
}

/// `screen` and `viewport`: a missing height makes the view square.
pub fn screen(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "screen ?-defer? ?-push? width ?height?";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(1, 2, USAGE)?;
    let width = parse_i32(inv.positional[0])?;
    let height = match inv.positional.get(1) {
        Some(word) => parse_i32(word)?,
        None => width,
    };
    if width <= 0 || height <= 0 {
        return Err(CommandError::Invalid(format!("bad screen size {}x{}", width, height)));
    }

    session.pending_mut().set_viewport(width as u32, height as u32);
    session.mark_update(inv.update, true);
    Ok(())
}

pub fn atom_scale(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "atomscale ?-defer? ?-push? ?-model name? ?scale?";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    inv.arity(0, 1, USAGE)?;
    let scale = match inv.positional.first() {
        Some(word) => parse_f64(word)?,
        None => session.tuning().default_atom_scale,
    };

    session.mark_update(inv.update, true);
    match inv.model_or_all() {
        "all" => {
            session.pending_mut().set_atom_scale(scale);
            Ok(())
        }
        model => session.send(&format!("set sphere_scale,{},{}", scale, model)),
    }
}

pub fn bond_thickness(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "bondthickness ?-defer? ?-push? ?-model name? ?thickness?";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    inv.arity(0, 1, USAGE)?;
    let thickness = match inv.positional.first() {
        Some(word) => parse_f64(word)?,
        None => session.tuning().default_bond_thickness,
    };

    session.mark_update(inv.update, true);
    match inv.model_or_all() {
        "all" => {
            session.pending_mut().set_bond_thickness(thickness);
            Ok(())
        }
        model => session.send(&format!("set stick_radius,{},{}", thickness, model)),
    }
}

fn show_labels_if_on(session: &mut Session, model: &str) -> Result<()> {
    if session.view().labels {
        session.send(&format!("show labels,{}", model))?;
    }
    Ok(())
}

pub fn ball_and_stick(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "ballnstick ?-defer? ?-push? ?-ghost|-normal? ?-model name?";
    let inv = Invocation::parse(args, Accepts::MODEL | Accepts::GHOST, USAGE)?;
    let model = target(&inv, USAGE)?;
    let (radius, transparency) = if inv.ghost { (0.1, 0.75) } else { (0.14, 0.0) };

    session.mark_update(inv.update, true);
    send_all(
        session,
        &[
            format!("hide everything,{}", model),
            format!("set stick_color,white,{}", model),
            format!("set stick_radius,{},{}", radius, model),
            format!("set sphere_scale,0.25,{}", model),
            format!("set sphere_transparency,{},{}", transparency, model),
            format!("set stick_transparency,{},{}", transparency, model),
            format!("show sticks,{}", model),
            format!("show spheres,{}", model),
        ],
    )?;
    show_labels_if_on(session, model)
}

pub fn spheres(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "spheres ?-defer? ?-push? ?-ghost|-normal? ?-model name?";
    let inv = Invocation::parse(args, Accepts::MODEL | Accepts::GHOST, USAGE)?;
    let model = target(&inv, USAGE)?;
    let transparency = if inv.ghost { 0.75 } else { 0.0 };

    session.mark_update(inv.update, true);
    send_all(
        session,
        &[
            format!("hide everything,{}", model),
            format!("set sphere_scale,0.41,{}", model),
            format!("set ambient,0.2,{}", model),
            format!("set sphere_transparency,{},{}", transparency, model),
            format!("show spheres,{}", model),
        ],
    )?;
    show_labels_if_on(session, model)
}

pub fn lines(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "lines ?-defer? ?-push? ?-ghost|-normal? ?-model name?";
    let inv = Invocation::parse(args, Accepts::MODEL | Accepts::GHOST, USAGE)?;
    let model = target(&inv, USAGE)?;
    let width = if inv.ghost { 0.25 } else { 1.0 };

    session.mark_update(inv.update, true);
    send_all(
        session,
        &[
            format!("hide everything,{}", model),
            format!("set line_width,{},{}", width, model),
            format!("show lines,{}", model),
        ],
    )?;
    show_labels_if_on(session, model)
}

/// `label ?on|off|toggle?`, on by default.
pub fn label(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "label ?-defer? ?-push? ?-model name? ?-size n? ?on|off|toggle?";
    let inv = Invocation::parse(args, Accepts::MODEL | Accepts::SIZE, USAGE)?;
    inv.arity(0, 1, USAGE)?;
    let show = match inv.positional.first() {
        Some(&"toggle") => !session.view().labels,
        Some(word) => parse_bool(word)?,
        None => true,
    };
    let size = match inv.size {
        Some(word) => parse_i32(word)?,
        None => session.tuning().label_size,
    };
    let model = inv.model_or_all();

    session.mark_update(inv.update, true);
    session.view_mut().labels = show;
    session.send(&format!("set label_color,white,{}", model))?;
    session.send(&format!("set label_size,{},{}", size, model))?;
    if show {
        session.send(&format!("label {},\"%s%s\" % (ID,name)", model))
    } else {
        session.send(&format!("label {}", model))
    }
}

pub fn enable(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "enable ?-defer? ?-push? ?model?";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    let model = target(&inv, USAGE)?;

    session.mark_update(inv.update, true);
    session.send(&format!("enable {}", model))
}

pub fn disable(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "disable ?-defer? ?-push? ?model?";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    let model = target(&inv, USAGE)?;

    session.mark_update(inv.update, true);
    session.send(&format!("disable {}", model))
}

/// Selects the animation frame. The image cache stays valid.
pub fn frame(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "frame ?-defer? ?-push? number";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let number = parse_i32(inv.positional[0])?;

    session.mark_update(inv.update, false);
    session.view_mut().frame = number;
    session.send(&format!("frame {}", number))
}

/// Turns about y to the given absolute rock offset.
pub fn rock(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "rock ?-defer? ?-push? offset";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let offset = parse_f64(inv.positional[0])?;

    session.mark_update(inv.update, false);
    let delta = offset - session.view().rock_offset;
    session.view_mut().rock_offset = offset;
    session.send(&format!("turn y,{}", delta))
}

pub fn reset(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "reset ?-defer? ?-push?";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(0, 0, USAGE)?;

    session.mark_update(inv.update, true);
    session.send("reset")?;
    session.send("zoom complete=1")
}

pub fn vmouse(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "vmouse ?-defer? ?-push? a b c d e";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(5, 5, USAGE)?;
    let values = inv
        .positional
        .iter()
        .map(|word| parse_i32(word).map(|n| n.to_string()))
        .collect::<Result<Vec<_>>>()?;

    session.mark_update(inv.update, true);
    session.send(&format!("vmouse {}", values.join(",")))
}

pub fn orthoscopic(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "orthoscopic ?-defer? ?-push? bool";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let on = parse_bool(inv.positional[0])?;

    session.mark_update(inv.update, true);
    session.send(&format!("set orthoscopic={}", on_off(on)))
}

/// Native command passed straight through.
pub fn raw(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "raw ?-defer? ?-push? command";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    if inv.positional.is_empty() {
        return Err(CommandError::Usage(USAGE));
    }
    let command = inv.positional.join(" ");

    session.mark_update(inv.update, true);
    session.send(command.trim_end())
}

pub fn cartoon(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "cartoon ?-defer? ?-push? ?-model name? bool";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let show = parse_bool(inv.positional[0])?;
    let model = inv.model_or_all();

    session.mark_update(inv.update, true);
    let verb = if show { "show" } else { "hide" };
    session.send(&format!("{} cartoon,{}", verb, model))
}

pub fn cartoon_trace(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "cartoontrace ?-defer? ?-push? ?-model name? bool";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let on = parse_bool(inv.positional[0])?;
    let model = inv.model_or_all();

    session.mark_update(inv.update, true);
    session.send(&format!("set cartoon_trace,{},{}", on_off(on), model))
}

pub fn transparency(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "transparency ?-defer? ?-push? ?-model name? value";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let value = parse_f64(inv.positional[0])?;
    let model = inv.model_or_all();

    session.mark_update(inv.update, true);
    send_all(
        session,
        &[
            format!("set sphere_transparency,{},{}", value, model),
            format!("set stick_transparency,{},{}", value, model),
            format!("set cartoon_transparency,{},{}", value, model),
        ],
    )
}

pub fn representation(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "representation ?-defer? ?-push? ?-model name? rep";
    let inv = Invocation::parse(args, Accepts::MODEL, USAGE)?;
    inv.arity(1, 1, USAGE)?;
    let model = inv.model_or_all();
    let steps: &[&str] = match inv.positional[0] {
        "ballnstick" => &[
            "set stick_color,white",
            "show sticks",
            "show spheres",
            "hide lines",
            "hide cartoon",
        ],
        "spheres" => &[
            "hide sticks",
            "show spheres",
            "hide lines",
            "hide cartoon",
            "set sphere_quality,2",
            "set ambient,0.2",
        ],
        "sticks" => &[
            "set stick_color,white",
            "show sticks",
            "hide spheres",
            "hide lines",
            "hide cartoon",
        ],
        "lines" => &["hide sticks", "hide spheres", "show lines", "hide cartoon"],
        "cartoon" => &["hide sticks", "hide spheres", "hide lines", "show cartoon"],
        "none" => &["hide sticks", "hide spheres", "hide lines", "hide cartoon"],
        other => {
            return Err(CommandError::Invalid(format!(
                "bad representation \"{}\": should be ballnstick, spheres, sticks, lines, cartoon or none",
                other
            )))
        }
    };

    session.mark_update(inv.update, true);
    let commands: Vec<String> = steps.iter().map(|step| format!("{},{}", step, model)).collect();
    send_all(session, &commands)
}

/// `loadpdb data|follows model state ?numBytes?`
///
/// With `follows`, the PDB text is the next `numBytes` bytes on the
/// client stream rather than an argument.
pub fn load_pdb(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "loadpdb ?-defer? ?-push? data|follows model state ?numBytes?";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(3, 4, USAGE)?;
    let name = inv.positional[1];
    let state = parse_i32(inv.positional[2])?;

    let data = if inv.positional[0] == "follows" {
        let Some(&count) = inv.positional.get(3) else {
            return Err(CommandError::Usage("loadpdb follows model state numBytes"));
        };
        let count = parse_i32(count)?;
        let count = usize::try_from(count)
            .map_err(|_| CommandError::Invalid(format!("bad value for # bytes \"{}\"", count)))?;
        session.read_client_bytes(count)?
    } else {
        if inv.positional.len() != 3 {
            return Err(CommandError::Usage(USAGE));
        }
        inv.positional[0].as_bytes().to_vec()
    };

    session.mark_update(inv.update, false);
    session.view_mut().cache_id = u64::try_from(state).unwrap_or(0);
    let path = session.write_pdb(&data)?;
    info!("Loading {} bytes of PDB data as {}", data.len(), name);
    session.send(&format!("load {}, {}, {}", path.display(), name, state))?;
    session.send("zoom buffer=2")
}

fn capture_as(session: &mut Session, args: &[String], format: ImageFormat, usage: &'static str) -> Result<()> {
    let inv = Invocation::parse(args, Accepts::empty(), usage)?;
    inv.arity(0, 0, usage)?;
    session.capture(format)
}

pub fn bmp(session: &mut Session, args: &[String]) -> Result<()> {
    capture_as(session, args, ImageFormat::Bmp, "bmp")
}

pub fn png(session: &mut Session, args: &[String]) -> Result<()> {
    capture_as(session, args, ImageFormat::Png, "png")
}

pub fn ppm(session: &mut Session, args: &[String]) -> Result<()> {
    capture_as(session, args, ImageFormat::Ppm, "ppm")
}

/// Ray-traced capture at a given size, tagged with the client's token.
pub fn print(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "print token width height color";
    let inv = Invocation::parse(args, Accepts::empty(), USAGE)?;
    inv.arity(4, 4, USAGE)?;
    let token = inv.positional[0];
    let width = parse_i32(inv.positional[1])?;
    let height = parse_i32(inv.positional[2])?;
    let background = inv.positional[3];

    if background == "none" {
        session.send("set ray_opaque_background,off")?;
    } else {
        session.send("set ray_opaque_background,on")?;
        session.send(&format!("bg_color {}", background))?;
    }
    session.send("refresh")?;
    session.capture_tagged(
        &format!("png -,width={},height={},ray=1,dpi=300", width, height),
        token,
    )?;
    session.send("bg_color black")
}

/// `clientinfo {key value ...}`: pairs recorded in the session record.
pub fn client_info(session: &mut Session, args: &[String]) -> Result<()> {
    const USAGE: &str = "clientinfo list";
    if args.len() != 1 {
        return Err(CommandError::Usage(USAGE));
    }
    let items = split_list(&args[0])?;
    if items.len() % 2 != 0 {
        return Err(CommandError::Invalid(
            "client info list must hold key/value pairs".to_string(),
        ));
    }
    for pair in items.chunks(2) {
        debug!("client info {} = {}", pair[0], pair[1]);
        session.stats_mut().add_client_info(&pair[0], &pair[1]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::core::engine::tests::Reply;
    use crate::proxy::session::tests::{harness, image_engine, Harness};
    use crate::proxy::session::RenderFlags;

    fn prompt_harness() -> Harness {
        harness(|_| Reply::Prompt, |_| {})
    }

    fn output_text(h: &mut Harness) -> String {
        String::from_utf8(h.client_output()).unwrap()
    }

    #[test]
    fn test_scenario_screen_then_bmp() {
        let mut h = harness(image_engine(b"12345".to_vec()), |_| {});

        h.session.execute("screen 400 300\nbmp\n");

        assert_eq!(h.sent(), vec!["viewport 400,300", "refresh", "refresh", "bmp -"]);
        let mut out = h.client_output();
        let payload = out.split_off(out.len() - 5);
        assert_eq!(payload, b"12345");
        assert_eq!(out, b"nv>image 5 1 1 0\n");
    }

    #[test]
    fn test_scenario_cancelling_rotations() {
        let mut h = harness(image_engine(b"IMG".to_vec()), |_| {});

        h.session.execute("rotate 10 0 0\nrotate -10 0 0\nbmp\n");

        assert_eq!(h.sent(), vec!["refresh", "bmp -"]);
        assert!(h.session.pending().is_empty());
        assert!(h.session.outbox().has_frames());
    }

    #[test]
    fn test_scenario_model_scale_is_immediate() {
        let mut h = prompt_harness();

        h.session.execute("atomscale -model ligand 0.3\n");

        assert_eq!(h.sent(), vec!["set sphere_scale,0.3,ligand"]);
        assert_eq!(h.session.pending().atom_scale(), None);
        assert!(h.session.flags().contains(RenderFlags::UPDATE_PENDING));
    }

    #[test]
    fn test_scenario_hung_engine() {
        let hung = Arc::new(AtomicBool::new(false));
        let flag = hung.clone();
        let mut h = harness(
            move |cmd| {
                if cmd.starts_with("hide everything") {
                    flag.store(true, Ordering::SeqCst);
                }
                if flag.load(Ordering::SeqCst) {
                    Reply::Silent
                } else {
                    Reply::Prompt
                }
            },
            |config| config.engine.io_timeout_ms = 200,
        );

        // The first exchange times out and the rest of the command is skipped
        let started = Instant::now();
        h.session.execute("ballnstick\n");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.sent(), vec!["hide everything,all"]);
        assert!(h.session.engine_failure().is_some());

        // A frame request fails in bounded time and queues nothing
        let started = Instant::now();
        h.session.execute("png\n");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!h.session.outbox().has_frames());

        let out = output_text(&mut h);
        assert_eq!(out.matches("nv>error -type command").count(), 2);
        assert!(out.contains("did not answer"));
    }

    #[test]
    fn test_bad_numbers_do_not_reach_engine() {
        let mut h = prompt_harness();

        h.session.execute("rotate 1 x 0\npan 1\nzoom\nscreen -4\nvmouse 1 2 3\n");

        assert!(h.sent().is_empty());
        assert!(h.session.pending().is_empty());
        assert_eq!(h.session.flags(), RenderFlags::empty());
        assert_eq!(output_text(&mut h).lines().count(), 5);
    }

    #[test]
    fn test_pan_is_scaled_and_inverted() {
        let mut h = prompt_harness();

        h.session.execute("pan 10 20\npan 2 -4\n");

        assert_eq!(h.session.pending().pan(), Some((0.1, 0.2)));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_zero_pan_and_zoom_are_ignored() {
        let mut h = prompt_harness();

        h.session.execute("pan 0 0\nzoom 0\n");

        assert!(h.session.pending().is_empty());
        assert!(h.session.flags().contains(RenderFlags::UPDATE_PENDING));
    }

    #[test]
    fn test_defer_and_push() {
        let mut h = prompt_harness();

        h.session.execute("rotate -defer 5 0 0\n");
        assert_eq!(h.session.flags(), RenderFlags::INVALIDATE_CACHE);

        h.session.execute("zoom -push 2\n");
        assert!(h
            .session
            .flags()
            .contains(RenderFlags::UPDATE_PENDING | RenderFlags::FORCE_UPDATE));
    }

    #[test]
    fn test_square_screen() {
        let mut h = prompt_harness();
        h.session.execute("viewport 256\n");
        assert_eq!(h.session.pending().viewport(), Some((256, 256)));
    }

    #[test]
    fn test_global_scales_use_defaults() {
        let mut h = prompt_harness();

        h.session.execute("spherescale\nstickradius 0.4\n");

        assert_eq!(h.session.pending().atom_scale(), Some(0.25));
        assert_eq!(h.session.pending().bond_thickness(), Some(0.4));
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_ghost_ball_and_stick() {
        let mut h = prompt_harness();

        h.session.execute("ballnstick -ghost -model protein\n");

        assert_eq!(
            h.sent(),
            vec![
                "hide everything,protein",
                "set stick_color,white,protein",
                "set stick_radius,0.1,protein",
                "set sphere_scale,0.25,protein",
                "set sphere_transparency,0.75,protein",
                "set stick_transparency,0.75,protein",
                "show sticks,protein",
                "show spheres,protein",
            ]
        );
    }

    #[test]
    fn test_labels_follow_style_switches() {
        let mut h = prompt_harness();

        h.session.execute("label -size 12 toggle\n");
        assert!(h.session.view().labels);
        assert_eq!(
            h.sent(),
            vec![
                "set label_color,white,all",
                "set label_size,12,all",
                "label all,\"%s%s\" % (ID,name)",
            ]
        );

        h.session.execute("lines\n");
        assert_eq!(
            h.sent(),
            vec!["hide everything,all", "set line_width,1,all", "show lines,all", "show labels,all"]
        );

        h.session.execute("label off\nspheres -model water\n");
        assert!(!h.session.view().labels);
        let sent = h.sent();
        assert!(sent.contains(&"label all".to_string()));
        assert_eq!(sent.last().map(String::as_str), Some("show spheres,water"));
    }

    #[test]
    fn test_frame_and_rock_keep_cache() {
        let mut h = prompt_harness();

        h.session.execute("frame 7\nrock 10\nrock 4\n");

        assert_eq!(h.sent(), vec!["frame 7", "turn y,10", "turn y,-6"]);
        assert_eq!(h.session.view().frame, 7);
        assert_eq!(h.session.view().rock_offset, 4.0);
        assert!(!h.session.flags().contains(RenderFlags::INVALIDATE_CACHE));
    }

    #[test]
    fn test_simple_pass_through_commands() {
        let mut h = prompt_harness();

        h.session.execute(
            "reset\nvmouse 1 2 3 4 5\northoscopic yes\nenable ligand\ndisable\n\
             cartoon -model p on\ncartoontrace 0\ntransparency 0.5\nraw {color red, all}\n",
        );

        assert_eq!(
            h.sent(),
            vec![
                "reset",
                "zoom complete=1",
                "vmouse 1,2,3,4,5",
                "set orthoscopic=1",
                "enable ligand",
                "disable all",
                "show cartoon,p",
                "set cartoon_trace,0,all",
                "set sphere_transparency,0.5,all",
                "set stick_transparency,0.5,all",
                "set cartoon_transparency,0.5,all",
                "color red, all",
            ]
        );
    }

    #[test]
    fn test_representation() {
        let mut h = prompt_harness();

        h.session.execute("representation -model m cartoon\n");
        assert_eq!(
            h.sent(),
            vec!["hide sticks,m", "hide spheres,m", "hide lines,m", "show cartoon,m"]
        );

        h.session.execute("representation wireframe\n");
        assert!(h.sent().is_empty());
        assert!(output_text(&mut h).contains("bad representation"));
    }

    #[test]
    fn test_loadpdb_inline() {
        let mut h = prompt_harness();

        h.session.execute("loadpdb {ATOM 1\nEND\n} protein 3\n");

        let path = h.session.pdb_path().to_path_buf();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ATOM 1\nEND\n");
        assert_eq!(
            h.sent(),
            vec![format!("load {}, protein, 3", path.display()), "zoom buffer=2".to_string()]
        );
        assert_eq!(h.session.view().cache_id, 3);
    }

    #[test]
    fn test_loadpdb_follows() {
        let mut h = prompt_harness();
        let pdb = b"ATOM      1\n";

        h.client.write_all(b"loadpdb follows prot 1 12\n").unwrap();
        h.client.write_all(pdb).unwrap();
        h.client.write_all(b"reset\n").unwrap();
        h.session.read_client().unwrap();

        assert_eq!(fs::read(h.session.pdb_path()).unwrap(), pdb);
        let sent = h.sent();
        assert_eq!(sent.len(), 4);
        assert!(sent[0].ends_with(", prot, 1"));
        assert_eq!(sent[2], "reset");
    }

    #[test]
    fn test_print_uses_token() {
        let mut h = harness(image_engine(b"RAY".to_vec()), |_| {});

        h.session.execute("print tok1 200 100 none\n");

        assert_eq!(
            h.sent(),
            vec![
                "set ray_opaque_background,off",
                "refresh",
                "png -,width=200,height=100,ray=1,dpi=300",
                "bg_color black",
            ]
        );
        assert_eq!(h.client_output(), b"nv>image 3 tok1 0 0\nRAY");
    }

    #[test]
    fn test_ppm_capture_command() {
        let mut h = harness(image_engine(b"P6".to_vec()), |_| {});
        h.session.execute("ppm\n");
        assert_eq!(h.sent(), vec!["refresh", "png -,format=1"]);
    }

    #[test]
    fn test_client_info_pairs() {
        let mut h = prompt_harness();

        h.session.execute("clientinfo {user joe tool {mol viewer}}\n");
        let record = h.session.stats().record(0);
        assert!(record.contains(" user=\"joe\""));
        assert!(record.contains(" tool=\"mol viewer\""));

        h.session.execute("clientinfo {odd}\n");
        assert!(output_text(&mut h).contains("key/value pairs"));
    }
}
