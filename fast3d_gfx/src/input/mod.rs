/// Input module - controller port resolution and keyboard mapping

pub mod controller;

pub use controller::{
    Controller, ControllerButtons, ControllerKind, ControllerPad, ControllerSet,
    GamepadController, KeyBinding, KeyboardController, MAX_CONTROLLERS, STICK_MAX,
};
