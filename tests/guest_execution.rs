//! End-to-end guest scenarios: images programmed over the bootloader
//! protocol and executed out of flash by the VM.

use cockpit_vm::bootloader::{Bootloader, Config, Request, State};
use cockpit_vm::flash::BANK_A_ADDR;
use cockpit_vm::frame;
use cockpit_vm::gpio::Level;
use cockpit_vm::queue::{ByteQueue, Producer};
use cockpit_vm::sim::{SimClock, SimFlash, SimIo, SimTransport};
use cockpit_vm::vm::{image, Instruction, Opcode, Program, Vm};

const QUEUE: usize = 512;

fn push_request(queue: &mut Producer<'_, QUEUE>, request: &Request) {
    let mut payload = [0u8; 2048];
    let n = request.encode(&mut payload).unwrap();
    let mut framed = [0u8; frame::MAX_FRAME];
    let m = frame::encode(&payload[..n], &mut framed).unwrap();
    assert_eq!(queue.push_slice(&framed[..m]), m);
}

/// Program `image_bytes` into bank A through the full protocol walk.
fn flash_image(flash: &mut SimFlash, image_bytes: &[u8]) {
    // Pre-seed so the health probe keeps bank A active.
    flash.patch(BANK_A_ADDR, &[0x43, 0x4F, 0x4E, 0x43, 0x20, 0x00, 0x00, 0x00]);

    let mut queue: ByteQueue<QUEUE> = ByteQueue::new();
    let (mut tx, rx) = queue.split();
    let clock = SimClock::new();
    let mut transport = SimTransport::new();
    let mut boot: Bootloader<'_, QUEUE> = Bootloader::new(rx, flash, &clock, Config::default());

    push_request(&mut tx, &Request::handshake(1, "flash_program", 1024));
    push_request(&mut tx, &Request::prepare(2, image_bytes.len() as u32));
    push_request(&mut tx, &Request::data(3, 0, image_bytes));
    push_request(&mut tx, &Request::verify(4));
    boot.poll(flash, &clock, &mut transport).unwrap();
    assert_eq!(boot.session().state(), State::Idle);
}

#[test]
fn programmed_image_runs_from_flash() {
    // (10 / 3) * 3 - 10 == -1
    let code = [
        Instruction::new(Opcode::Push, 10),
        Instruction::new(Opcode::Push, 3),
        Instruction::new(Opcode::Div, 0),
        Instruction::new(Opcode::Push, 3),
        Instruction::new(Opcode::Mul, 0),
        Instruction::new(Opcode::Push, 10),
        Instruction::new(Opcode::Sub, 0),
        Instruction::new(Opcode::Halt, 0),
    ];
    let mut image_bytes = [0u8; 256];
    let image_len = image::build(&code, &[], &mut image_bytes).unwrap();

    let mut flash = SimFlash::new();
    flash_image(&mut flash, &image_bytes[..image_len]);

    // What the orchestrator would read at boot.
    let stored = flash.region(BANK_A_ADDR, image_len).to_vec();
    assert_eq!(&stored, &image_bytes[..image_len]);

    let mut vm = Vm::new(SimIo::new(), SimClock::new());
    vm.load_image(&stored).unwrap();
    vm.execute_program().unwrap();

    assert!(vm.is_halted());
    assert_eq!(vm.stack().peek(0), Ok(-1));
    assert_eq!(vm.metrics().instructions_retired, 7);
}

#[test]
fn tampered_image_is_refused_at_load() {
    let code = [Instruction::new(Opcode::Halt, 0)];
    let mut image_bytes = [0u8; 64];
    let image_len = image::build(&code, &[], &mut image_bytes).unwrap();

    let mut flash = SimFlash::new();
    flash_image(&mut flash, &image_bytes[..image_len]);

    let mut stored = flash.region(BANK_A_ADDR, image_len).to_vec();
    // One flipped body bit.
    stored[image::HEADER_SIZE] ^= 0x04;

    let mut vm = Vm::new(SimIo::new(), SimClock::new());
    assert_eq!(vm.load_image(&stored), Err(image::Error::CrcMismatch));
}

#[test]
fn guest_blinks_and_reports_over_console() {
    // pinMode(13, OUTPUT); digitalWrite(13, HIGH); printf("led %d\n", 13);
    let code = [
        Instruction::new(Opcode::Push, 13),
        Instruction::new(Opcode::Push, 1),
        Instruction::new(Opcode::PinMode, 0),
        Instruction::new(Opcode::Push, 13),
        Instruction::new(Opcode::Push, 1),
        Instruction::new(Opcode::DigitalWrite, 0),
        Instruction::new(Opcode::Push, 13),
        Instruction::new(Opcode::Push, 1), // argc
        Instruction::new(Opcode::Printf, 0),
        Instruction::new(Opcode::Halt, 0),
    ];
    let mut image_bytes = [0u8; 256];
    let image_len = image::build(&code, &["led %d\n"], &mut image_bytes).unwrap();

    let mut flash = SimFlash::new();
    flash_image(&mut flash, &image_bytes[..image_len]);
    let stored = flash.region(BANK_A_ADDR, image_len).to_vec();

    let mut vm = Vm::new(SimIo::new(), SimClock::new());
    vm.load_image(&stored).unwrap();
    vm.execute_program().unwrap();

    assert_eq!(vm.io().output_level(13), Level::High);
    assert_eq!(vm.io().console(), "led 13\n");
}

#[test]
fn arrays_survive_a_full_guest_run() {
    // a = new int[4]; a[2] = 7; g0 = a[2];
    let code = [
        Instruction::new(Opcode::CreateArray, 4), // handle on stack
        Instruction::new(Opcode::StoreGlobal, 1), // g1 = handle
        // a[2] = 7
        Instruction::new(Opcode::LoadGlobal, 1),
        Instruction::new(Opcode::Push, 2),
        Instruction::new(Opcode::Push, 7),
        Instruction::new(Opcode::StoreArray, 0),
        // g0 = a[2]
        Instruction::new(Opcode::LoadGlobal, 1),
        Instruction::new(Opcode::Push, 2),
        Instruction::new(Opcode::LoadArray, 0),
        Instruction::new(Opcode::StoreGlobal, 0),
        Instruction::new(Opcode::Halt, 0),
    ];
    let code_bytes: Vec<u8> = code.iter().flat_map(|i| i.to_le_bytes()).collect();

    let mut vm = Vm::new(SimIo::new(), SimClock::new());
    vm.load_program(Program::new(&code_bytes, &[]).unwrap());
    vm.execute_program().unwrap();

    assert_eq!(vm.memory().load_global(0), Ok(7));
    assert_eq!(vm.memory().pool_used(), 4);
}
