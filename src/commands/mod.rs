pub mod qemu_img;
