//! Controller ports
//!
//! Each of the four N64 controller ports is resolved once, from the
//! configuration store, into a tagged [`Controller`]. Keyboard events are
//! dispatched only to keyboard ports; gamepad ports are fed by the host's
//! own input layer.

use std::str::FromStr;

use rustc_hash::FxHashMap;
use winit::keyboard::KeyCode;

use crate::config::JsonConfig;
use crate::error::Error;

const SOURCE: &str = "fast3d::input";

/// Number of controller ports
pub const MAX_CONTROLLERS: usize = 4;

/// Full stick deflection reported for a held direction key
pub const STICK_MAX: i8 = 127;

bitflags::bitflags! {
    /// N64 controller button mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ControllerButtons: u16 {
        const A = 0x8000;
        const B = 0x4000;
        const Z = 0x2000;
        const START = 0x1000;
        const D_UP = 0x0800;
        const D_DOWN = 0x0400;
        const D_LEFT = 0x0200;
        const D_RIGHT = 0x0100;
        const L = 0x0020;
        const R = 0x0010;
        const C_UP = 0x0008;
        const C_DOWN = 0x0004;
        const C_LEFT = 0x0002;
        const C_RIGHT = 0x0001;
    }
}

/// State of one controller as the game reads it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerPad {
    pub button: u16,
    pub stick_x: i8,
    pub stick_y: i8,
    pub err_no: u8,
}

/// Controller type configured for a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    Keyboard,
    Gamepad,
    Unplugged,
}

impl FromStr for ControllerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyboard" => Ok(ControllerKind::Keyboard),
            "gamepad" => Ok(ControllerKind::Gamepad),
            "unplugged" => Ok(ControllerKind::Unplugged),
            other => Err(Error::ConfigError(format!("invalid controller type '{}'", other))),
        }
    }
}

/// What a keyboard key drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBinding {
    Button(ControllerButtons),
    StickUp,
    StickDown,
    StickLeft,
    StickRight,
}

#[derive(Debug, Clone, Copy, Default)]
struct StickKeys {
    up: bool,
    down: bool,
    left: bool,
    right: bool,
}

/// Keyboard-driven controller
#[derive(Debug, Clone)]
pub struct KeyboardController {
    port: usize,
    bindings: FxHashMap<KeyCode, KeyBinding>,
    pressed: ControllerButtons,
    stick: StickKeys,
}

impl KeyboardController {
    /// Controller with the default layout (stick on WASD)
    pub fn new(port: usize) -> Self {
        let mut controller = Self {
            port,
            bindings: FxHashMap::default(),
            pressed: ControllerButtons::empty(),
            stick: StickKeys::default(),
        };
        let defaults = [
            (KeyCode::KeyX, KeyBinding::Button(ControllerButtons::A)),
            (KeyCode::KeyC, KeyBinding::Button(ControllerButtons::B)),
            (KeyCode::KeyZ, KeyBinding::Button(ControllerButtons::Z)),
            (KeyCode::Enter, KeyBinding::Button(ControllerButtons::START)),
            (KeyCode::KeyQ, KeyBinding::Button(ControllerButtons::L)),
            (KeyCode::KeyE, KeyBinding::Button(ControllerButtons::R)),
            (KeyCode::KeyT, KeyBinding::Button(ControllerButtons::D_UP)),
            (KeyCode::KeyG, KeyBinding::Button(ControllerButtons::D_DOWN)),
            (KeyCode::KeyF, KeyBinding::Button(ControllerButtons::D_LEFT)),
            (KeyCode::KeyH, KeyBinding::Button(ControllerButtons::D_RIGHT)),
            (KeyCode::KeyI, KeyBinding::Button(ControllerButtons::C_UP)),
            (KeyCode::KeyK, KeyBinding::Button(ControllerButtons::C_DOWN)),
            (KeyCode::KeyJ, KeyBinding::Button(ControllerButtons::C_LEFT)),
            (KeyCode::KeyL, KeyBinding::Button(ControllerButtons::C_RIGHT)),
            (KeyCode::KeyW, KeyBinding::StickUp),
            (KeyCode::KeyS, KeyBinding::StickDown),
            (KeyCode::KeyA, KeyBinding::StickLeft),
            (KeyCode::KeyD, KeyBinding::StickRight),
        ];
        for (key, binding) in defaults {
            controller.bind(key, binding);
        }
        controller
    }

    pub fn port(&self) -> usize {
        self.port
    }

    /// Bind (or rebind) a key
    pub fn bind(&mut self, key: KeyCode, binding: KeyBinding) {
        self.bindings.insert(key, binding);
    }

    pub fn unbind(&mut self, key: KeyCode) {
        self.bindings.remove(&key);
    }

    /// Returns whether the key is bound on this controller
    pub fn press(&mut self, key: KeyCode) -> bool {
        self.apply(key, true)
    }

    pub fn release(&mut self, key: KeyCode) -> bool {
        self.apply(key, false)
    }

    pub fn release_all(&mut self) {
        self.pressed = ControllerButtons::empty();
        self.stick = StickKeys::default();
    }

    fn apply(&mut self, key: KeyCode, down: bool) -> bool {
        let Some(binding) = self.bindings.get(&key).copied() else {
            return false;
        };
        match binding {
            KeyBinding::Button(button) => self.pressed.set(button, down),
            KeyBinding::StickUp => self.stick.up = down,
            KeyBinding::StickDown => self.stick.down = down,
            KeyBinding::StickLeft => self.stick.left = down,
            KeyBinding::StickRight => self.stick.right = down,
        }
        true
    }

    pub fn read(&self, pad: &mut ControllerPad) {
        pad.button |= self.pressed.bits();
        pad.stick_x = axis(self.stick.right, self.stick.left);
        pad.stick_y = axis(self.stick.up, self.stick.down);
    }
}

fn axis(positive: bool, negative: bool) -> i8 {
    match (positive, negative) {
        (true, false) => STICK_MAX,
        (false, true) => -STICK_MAX,
        _ => 0,
    }
}

/// Controller whose state is pushed by the host
#[derive(Debug, Clone, Default)]
pub struct GamepadController {
    state: ControllerPad,
}

impl GamepadController {
    pub fn set_state(&mut self, state: ControllerPad) {
        self.state = state;
    }

    pub fn read(&self, pad: &mut ControllerPad) {
        pad.button |= self.state.button;
        pad.stick_x = self.state.stick_x;
        pad.stick_y = self.state.stick_y;
        pad.err_no = self.state.err_no;
    }
}

#[derive(Debug, Clone)]
pub enum Controller {
    Keyboard(KeyboardController),
    Gamepad(GamepadController),
    Unplugged,
}

impl Controller {
    pub fn new(kind: ControllerKind, port: usize) -> Self {
        match kind {
            ControllerKind::Keyboard => Controller::Keyboard(KeyboardController::new(port)),
            ControllerKind::Gamepad => Controller::Gamepad(GamepadController::default()),
            ControllerKind::Unplugged => Controller::Unplugged,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        match self {
            Controller::Keyboard(_) => ControllerKind::Keyboard,
            Controller::Gamepad(_) => ControllerKind::Gamepad,
            Controller::Unplugged => ControllerKind::Unplugged,
        }
    }

    pub fn is_plugged(&self) -> bool {
        !matches!(self, Controller::Unplugged)
    }
}

/// The four controller ports
#[derive(Debug, Clone)]
pub struct ControllerSet {
    ports: [Controller; MAX_CONTROLLERS],
}

impl ControllerSet {
    pub fn new(kinds: [ControllerKind; MAX_CONTROLLERS]) -> Self {
        let mut port = 0;
        Self {
            ports: kinds.map(|kind| {
                port += 1;
                Controller::new(kind, port - 1)
            }),
        }
    }

    /// Resolve port types from `CONTROLLERS.CONTROLLER n`
    ///
    /// Port 0 defaults to the keyboard, the others to unplugged. Invalid type
    /// strings are logged and leave the port unplugged.
    pub fn from_config(config: &JsonConfig) -> Self {
        let mut kinds = [ControllerKind::Unplugged; MAX_CONTROLLERS];
        for (port, kind) in kinds.iter_mut().enumerate() {
            let default = if port == 0 { "keyboard" } else { "unplugged" };
            let name = config.get_string(&Self::config_key(port), default);
            *kind = name.parse().unwrap_or_else(|e| {
                crate::engine_error!(SOURCE, "Port {}: {}", port, e);
                ControllerKind::Unplugged
            });
        }
        Self::new(kinds)
    }

    pub fn config_key(port: usize) -> String {
        format!("CONTROLLERS.CONTROLLER {}", port)
    }

    /// Bit n set when port n is plugged
    pub fn controller_bits(&self) -> u8 {
        self.ports
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_plugged())
            .fold(0, |bits, (port, _)| bits | (1 << port))
    }

    pub fn port(&self, port: usize) -> Option<&Controller> {
        self.ports.get(port)
    }

    pub fn port_mut(&mut self, port: usize) -> Option<&mut Controller> {
        self.ports.get_mut(port)
    }

    /// Returns whether any keyboard port consumed the key
    pub fn key_down(&mut self, key: KeyCode) -> bool {
        self.keyboards().fold(false, |used, pad| pad.press(key) || used)
    }

    pub fn key_up(&mut self, key: KeyCode) -> bool {
        self.keyboards().fold(false, |used, pad| pad.release(key) || used)
    }

    pub fn all_keys_up(&mut self) {
        self.keyboards().for_each(KeyboardController::release_all);
    }

    /// Fill one pad per port; unplugged ports read as zero
    pub fn read(&self, pads: &mut [ControllerPad]) {
        for (controller, pad) in self.ports.iter().zip(pads.iter_mut()) {
            *pad = ControllerPad::default();
            match controller {
                Controller::Keyboard(keyboard) => keyboard.read(pad),
                Controller::Gamepad(gamepad) => gamepad.read(pad),
                Controller::Unplugged => {}
            }
        }
    }

    fn keyboards(&mut self) -> impl Iterator<Item = &mut KeyboardController> {
        self.ports.iter_mut().filter_map(|c| match c {
            Controller::Keyboard(keyboard) => Some(keyboard),
            _ => None,
        })
    }
}
