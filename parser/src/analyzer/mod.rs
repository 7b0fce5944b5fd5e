pub mod battle_controller;
