// MAVL: teaching compiler and stack virtual machine.
//
// Copyright (C) 2020  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

extern crate byteorder;
extern crate regex;
extern crate ron;
extern crate serde;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod asm;
pub mod ast;
pub mod codegen;
pub mod config;
pub mod error;
pub mod image;
pub mod machine;
pub mod primitives;
pub mod value;
pub mod vm;
